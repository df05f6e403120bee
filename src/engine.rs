//! Scan engine
//!
//! Wires the pieces into one job run: membership filter -> rule evaluation
//! -> aggregation on the response path, orchestrator for scheduling, and
//! the two collaborator boundaries (status persistence, report handoff).

use crate::aggregate::Aggregator;
use crate::config::ScanSettings;
use crate::error::{LynkeusError, Result};
use crate::filter::BloomFilter;
use crate::models::{FailedTarget, JobStatus, ObservedResponse, ScanJob, ScanResult};
use crate::orchestrator::Orchestrator;
use crate::rules;
use crate::session::{Navigation, SessionFactory};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

/// Persistence collaborator boundary. Called at exactly two points: job
/// start and job end.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn job_started(&self, job: &ScanJob);
    async fn job_finished(&self, scan_id: &str, status: JobStatus);
}

/// Default sink that records lifecycle transitions in the log only
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn job_started(&self, job: &ScanJob) {
        info!("Scan {} running against {}", job.scan_id, job.target);
    }

    async fn job_finished(&self, scan_id: &str, status: JobStatus) {
        info!("Scan {scan_id} finished: {status}");
    }
}

/// A job-level failure. Verdicts recorded before the failure ride along -
/// partial results are never silently discarded.
#[derive(Debug)]
pub struct JobFailure {
    pub error: LynkeusError,
    pub partial: ScanResult,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan {} failed: {}", self.partial.scan_id, self.error)
    }
}

impl std::error::Error for JobFailure {}

/// The response-handling path shared by every task: scope check, static
/// resource skip, filter dedup, rule evaluation, aggregation.
pub struct ResponsePipeline {
    filter: Mutex<BloomFilter>,
    aggregator: Arc<Aggregator>,
    scope_host: String,
}

impl ResponsePipeline {
    pub fn new(filter: BloomFilter, aggregator: Arc<Aggregator>, scope_host: String) -> Self {
        Self {
            filter: Mutex::new(filter),
            aggregator,
            scope_host,
        }
    }

    fn filter_insert(&self, key: &str) -> bool {
        self.filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key)
    }

    /// Claims a URL at submission time; `false` means it was already seen
    /// (or a filter false positive) and must be skipped.
    pub fn claim(&self, url: &str) -> bool {
        self.filter_insert(&normalize_url(url))
    }

    /// Runs one observed response through dedup and the full catalogue.
    /// Returns `true` when this call evaluated the task's own document.
    ///
    /// The task URL was claimed in the filter at submit time, so it is
    /// admitted through the `main_evaluated` flag instead of a second
    /// filter probe; every other URL is checked-and-inserted here.
    pub fn process(
        &self,
        task_url: &str,
        main_evaluated: bool,
        response: ObservedResponse,
    ) -> bool {
        let url = normalize_url(&response.url);
        if !self.in_scope(&url) {
            return false;
        }
        if is_static_path(&url) {
            // Includes image requests fulfilled with the local placeholder
            return false;
        }

        let is_main = url == normalize_url(task_url);
        let fresh = if is_main {
            !main_evaluated
        } else {
            self.filter_insert(&url)
        };
        if !fresh {
            return false;
        }

        debug!("Evaluating {} ({} headers)", url, response.headers.len());
        self.aggregator.note_response();
        for verdict in rules::evaluate(&response) {
            self.aggregator.record(&verdict, &response);
        }
        is_main
    }

    fn in_scope(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => parsed.host_str() == Some(self.scope_host.as_str()),
            Err(_) => false,
        }
    }
}

/// Normalizes a URL for deduplication (strips fragment and trailing slash)
pub fn normalize_url(url: &str) -> String {
    if let Ok(mut parsed) = Url::parse(url) {
        parsed.set_fragment(None);
        let mut result = parsed.to_string();
        if result.ends_with('/') && result.len() > 1 {
            result.pop();
        }
        result
    } else {
        url.to_string()
    }
}

/// Static assets carry no interesting security headers and include the
/// placeholder-fulfilled image requests
pub fn is_static_path(url: &str) -> bool {
    const STATIC_EXTENSIONS: &[&str] = &[
        "css", "js", "jpg", "jpeg", "png", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf",
        "eot", "otf", "mp4", "mp3", "wav", "ogg", "webm",
    ];

    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => return false,
    };
    let extension = path.rsplit('/').next().and_then(|f| f.rsplit_once('.'));
    match extension {
        Some((_, ext)) => STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// Runs scan jobs end to end against a session backend
pub struct ScanEngine {
    factory: Arc<dyn SessionFactory>,
    settings: ScanSettings,
    status: Arc<dyn StatusSink>,
}

impl ScanEngine {
    pub fn new(factory: Arc<dyn SessionFactory>, settings: ScanSettings) -> Self {
        Self {
            factory,
            settings,
            status: Arc::new(LogSink),
        }
    }

    /// Replaces the default log-only persistence sink
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = sink;
        self
    }

    /// Runs one job to a terminal state. The job either completes with a
    /// full `ScanResult` or fails with whatever was recorded so far
    /// attached.
    pub async fn run(&self, job: ScanJob) -> std::result::Result<ScanResult, JobFailure> {
        let started_at = Local::now();
        self.status.job_started(&job).await;

        match self.execute(&job, started_at).await {
            Ok(result) => {
                self.status
                    .job_finished(&job.scan_id, JobStatus::Success)
                    .await;
                Ok(result)
            }
            Err((error, partial)) => {
                self.status
                    .job_finished(&job.scan_id, JobStatus::Failed)
                    .await;
                Err(JobFailure { error, partial })
            }
        }
    }

    async fn execute(
        &self,
        job: &ScanJob,
        started_at: DateTime<Local>,
    ) -> std::result::Result<ScanResult, (LynkeusError, ScanResult)> {
        let aggregator = Arc::new(Aggregator::new(self.settings.max_listed_urls));

        // Fatal configuration errors fail the job immediately, no retry
        let prepared = self.validate(job);
        let (target, scope_host) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let partial = self.build_result(job, started_at, &aggregator, Vec::new());
                return Err((e, partial));
            }
        };

        let pipeline = Arc::new(ResponsePipeline::new(
            BloomFilter::new(
                self.settings.filter_capacity,
                self.settings.filter_error_rate,
            ),
            Arc::clone(&aggregator),
            scope_host,
        ));

        let (orchestrator, mut failures) = Orchestrator::new(
            self.settings.orchestrator_config(job.concurrency),
            Arc::clone(&self.factory),
            pipeline,
        );

        let navigation = match &job.script {
            Some(script) => Navigation::Script(script.clone()),
            None => Navigation::Url(target.clone()),
        };

        if let Err(e) = orchestrator.submit(target.as_str(), navigation).await {
            orchestrator.shutdown().await;
            let partial = self.build_result(job, started_at, &aggregator, Vec::new());
            return Err((e, partial));
        }

        orchestrator.await_idle().await;

        let mut failed_targets = Vec::new();
        while let Ok(failure) = failures.try_recv() {
            failed_targets.push(FailedTarget {
                url: failure.url,
                attempts: failure.attempts,
                error: failure.error.to_string(),
            });
        }

        orchestrator.shutdown().await;

        let result = self.build_result(job, started_at, &aggregator, failed_targets);

        // Every task failed and nothing was observed: that is a dead job,
        // not an empty site
        if result.responses_evaluated == 0 && !result.failed_targets.is_empty() {
            let reason = result.failed_targets[0].error.clone();
            return Err((LynkeusError::NavigationError(reason), result));
        }

        Ok(result)
    }

    fn validate(&self, job: &ScanJob) -> Result<(String, String)> {
        let target = job.target.trim_end_matches('/').to_string();
        let parsed = Url::parse(&target)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| LynkeusError::ConfigError(format!("target has no host: {target}")))?
            .to_string();
        if let Some(script) = &job.script {
            script.validate()?;
        }
        Ok((target, host))
    }

    fn build_result(
        &self,
        job: &ScanJob,
        started_at: DateTime<Local>,
        aggregator: &Aggregator,
        failed_targets: Vec<FailedTarget>,
    ) -> ScanResult {
        let outcome = aggregator.finalize(&self.settings.thresholds());
        ScanResult {
            scan_id: job.scan_id.clone(),
            target: job.target.clone(),
            report: job.report.clone(),
            started_at,
            finished_at: Some(Local::now()),
            risk_level: outcome.risk_level,
            summaries: outcome.summaries,
            responses_evaluated: outcome.responses_evaluated,
            failed_targets,
        }
    }
}
