//! End-to-end scan engine behavior against the mock session backend

mod common;

use async_trait::async_trait;
use common::{hardened_response, plain_response, MockBackend, MockFactory};
use lynkeus::config::ScanSettings;
use lynkeus::engine::{ScanEngine, StatusSink};
use lynkeus::error::LynkeusError;
use lynkeus::models::{JobStatus, RiskLevel, ScanJob};
use lynkeus::rules;
use lynkeus::session::replay::{RecordedScript, Step};
use std::sync::{Arc, Mutex};

fn fast_settings() -> ScanSettings {
    ScanSettings {
        retry_delay_ms: 5,
        ..ScanSettings::default()
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn job_started(&self, job: &ScanJob) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{}:{}", job.scan_id, JobStatus::Running));
    }

    async fn job_finished(&self, scan_id: &str, status: JobStatus) {
        self.events.lock().unwrap().push(format!("{scan_id}:{status}"));
    }
}

#[tokio::test]
async fn test_headerless_fixture_fails_every_presence_rule() {
    let backend = MockBackend::new();
    let target = "https://fixture.example";
    backend.serve(target, vec![plain_response(target)]);

    let sink = Arc::new(RecordingSink::default());
    let engine = ScanEngine::new(MockFactory::new(Arc::clone(&backend)), fast_settings())
        .with_status_sink(Arc::clone(&sink) as Arc<dyn StatusSink>);

    let job = ScanJob::new(target);
    let scan_id = job.scan_id.clone();
    let result = engine.run(job).await.expect("scan should succeed");

    assert_eq!(result.responses_evaluated, 1);
    assert!(result.failed_targets.is_empty());
    assert_eq!(result.summaries.len(), rules::catalogue().len());

    for summary in &result.summaries {
        match summary.v_type.as_str() {
            "MISSING_HTTPONLY_COOKIE" | "MISSING_SECURE_COOKIE" => {
                assert_eq!(summary.pass_count, 1, "{}", summary.v_type);
            }
            _ => {
                assert_eq!(summary.fail_count, 1, "{}", summary.v_type);
                assert_eq!(summary.fail_urls, vec![target.to_string()]);
                assert!(summary.fail_headers.is_some());
            }
        }
    }

    // HSTS (high tier) fails, so the overall rating reflects it
    assert_eq!(result.risk_level, RiskLevel::High);

    assert_eq!(
        sink.events(),
        vec![
            format!("{scan_id}:running"),
            format!("{scan_id}:success"),
        ]
    );
}

#[tokio::test]
async fn test_hardened_fixture_rates_low() {
    let backend = MockBackend::new();
    let target = "https://fixture.example";
    backend.serve(target, vec![hardened_response(target)]);

    let engine = ScanEngine::new(MockFactory::new(backend), fast_settings());
    let result = engine.run(ScanJob::new(target)).await.expect("scan failed");

    assert_eq!(result.risk_level, RiskLevel::Low);
    for summary in &result.summaries {
        assert_eq!(summary.fail_count, 0, "{}", summary.v_type);
    }
}

#[tokio::test]
async fn test_trailing_slash_trimmed_from_target() {
    let backend = MockBackend::new();
    backend.serve(
        "https://fixture.example",
        vec![plain_response("https://fixture.example")],
    );

    let engine = ScanEngine::new(MockFactory::new(backend), fast_settings());
    let result = engine
        .run(ScanJob::new("https://fixture.example/"))
        .await
        .expect("scan failed");
    assert_eq!(result.responses_evaluated, 1);
}

#[tokio::test]
async fn test_recorded_script_replay() {
    let backend = MockBackend::new();
    let target = "https://fixture.example";
    backend.serve(target, vec![plain_response(target)]);

    let engine = ScanEngine::new(MockFactory::new(Arc::clone(&backend)), fast_settings());

    let mut job = ScanJob::new(target);
    job.script = Some(RecordedScript {
        title: "recorded".to_string(),
        steps: vec![Step::Navigate {
            url: target.to_string(),
        }],
    });

    let result = engine.run(job).await.expect("replay scan failed");
    assert_eq!(result.responses_evaluated, 1);
    assert_eq!(backend.navigations(), 1);
}

#[tokio::test]
async fn test_malformed_script_fails_without_retry() {
    let backend = MockBackend::new();
    let target = "https://fixture.example";
    backend.serve(target, vec![plain_response(target)]);

    let sink = Arc::new(RecordingSink::default());
    let engine = ScanEngine::new(MockFactory::new(Arc::clone(&backend)), fast_settings())
        .with_status_sink(Arc::clone(&sink) as Arc<dyn StatusSink>);

    let mut job = ScanJob::new(target);
    job.script = Some(RecordedScript {
        title: "broken".to_string(),
        steps: vec![Step::Click {
            selectors: Vec::new(),
        }],
    });
    let scan_id = job.scan_id.clone();

    let failure = engine.run(job).await.expect_err("job must fail");
    assert!(matches!(failure.error, LynkeusError::ScriptError(_)));
    assert_eq!(backend.navigations(), 0, "fatal errors are never retried");

    // Partial result still attached, with the full (empty) summary set
    assert_eq!(failure.partial.responses_evaluated, 0);
    assert_eq!(failure.partial.summaries.len(), rules::catalogue().len());

    assert_eq!(
        sink.events(),
        vec![
            format!("{scan_id}:running"),
            format!("{scan_id}:failed"),
        ]
    );
}

#[tokio::test]
async fn test_unreachable_target_fails_job_with_partial_attached() {
    let backend = MockBackend::new();
    let target = "https://fixture.example";
    backend.serve_flaky(target, vec![plain_response(target)], 99);

    let engine = ScanEngine::new(MockFactory::new(Arc::clone(&backend)), fast_settings());
    let failure = engine
        .run(ScanJob::new(target))
        .await
        .expect_err("job must fail when nothing was observed");

    assert!(matches!(failure.error, LynkeusError::NavigationError(_)));
    assert_eq!(failure.partial.failed_targets.len(), 1);
    assert_eq!(failure.partial.failed_targets[0].attempts, 4);
    assert_eq!(failure.partial.responses_evaluated, 0);
}

#[tokio::test]
async fn test_invalid_target_is_fatal() {
    let backend = MockBackend::new();
    let engine = ScanEngine::new(MockFactory::new(backend), fast_settings());

    let failure = engine
        .run(ScanJob::new("not a url"))
        .await
        .expect_err("invalid target must fail");
    assert!(matches!(
        failure.error,
        LynkeusError::UrlError(_) | LynkeusError::ConfigError(_)
    ));
}

#[tokio::test]
async fn test_verdicts_for_mixed_responses_split_by_url() {
    let backend = MockBackend::new();
    let target = "https://fixture.example";
    let api = "https://fixture.example/api/session";
    backend.serve(
        target,
        vec![hardened_response(target), plain_response(api)],
    );

    let engine = ScanEngine::new(MockFactory::new(backend), fast_settings());
    let result = engine.run(ScanJob::new(target)).await.expect("scan failed");

    assert_eq!(result.responses_evaluated, 2);
    let hsts = result
        .summaries
        .iter()
        .find(|s| s.v_type == "MISSING_HSTS")
        .unwrap();
    assert_eq!(hsts.pass_count, 1);
    assert_eq!(hsts.fail_count, 1);
    assert_eq!(hsts.pass_urls, vec![target.to_string()]);
    assert_eq!(hsts.fail_urls, vec![api.to_string()]);
    // One high-tier rule failing
    assert_eq!(result.risk_level, RiskLevel::High);
}
