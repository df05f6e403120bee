//! Common test utilities: an in-process session backend that serves
//! scripted responses instead of driving a real browser.

use async_trait::async_trait;
use lynkeus::error::{LynkeusError, Result};
use lynkeus::models::ObservedResponse;
use lynkeus::session::replay::RecordedScript;
use lynkeus::session::{SessionDriver, SessionFactory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted behavior for one target URL
#[derive(Clone, Default)]
pub struct MockTarget {
    /// Responses emitted once navigation succeeds
    pub responses: Vec<ObservedResponse>,
    /// How many attempts fail before one succeeds
    pub failures_before_success: u32,
    /// Artificial navigation latency
    pub delay_ms: u64,
}

/// Shared routing table and counters behind every mock session
#[derive(Default)]
pub struct MockBackend {
    targets: Mutex<HashMap<String, MockTarget>>,
    attempts: Mutex<HashMap<String, u32>>,
    navigations: AtomicU32,
    sessions_created: AtomicU32,
    sessions_closed: AtomicU32,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, responses: Vec<ObservedResponse>) {
        self.serve_target(
            url,
            MockTarget {
                responses,
                ..MockTarget::default()
            },
        );
    }

    pub fn serve_flaky(&self, url: &str, responses: Vec<ObservedResponse>, failures: u32) {
        self.serve_target(
            url,
            MockTarget {
                responses,
                failures_before_success: failures,
                ..MockTarget::default()
            },
        );
    }

    pub fn serve_target(&self, url: &str, target: MockTarget) {
        self.targets
            .lock()
            .unwrap()
            .insert(url.to_string(), target);
    }

    /// Navigation attempts made against one URL
    pub fn attempts_for(&self, url: &str) -> u32 {
        self.attempts.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn navigations(&self) -> u32 {
        self.navigations.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> u32 {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> u32 {
        self.sessions_closed.load(Ordering::SeqCst)
    }
}

pub struct MockFactory {
    backend: Arc<MockBackend>,
}

impl MockFactory {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self) -> Result<Arc<dyn SessionDriver>> {
        self.backend.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            backend: Arc::clone(&self.backend),
        }))
    }
}

pub struct MockSession {
    backend: Arc<MockBackend>,
}

#[async_trait]
impl SessionDriver for MockSession {
    async fn navigate(
        &self,
        url: &str,
        events: &mpsc::UnboundedSender<ObservedResponse>,
    ) -> Result<()> {
        self.backend.navigations.fetch_add(1, Ordering::SeqCst);

        let target = self
            .backend
            .targets
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| LynkeusError::NavigationError(format!("no route for {url}")))?;

        let attempt = {
            let mut attempts = self.backend.attempts.lock().unwrap();
            let entry = attempts.entry(url.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if target.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(target.delay_ms)).await;
        }

        if attempt <= target.failures_before_success {
            return Err(LynkeusError::NavigationError(format!(
                "simulated failure #{attempt} for {url}"
            )));
        }

        for response in target.responses {
            let _ = events.send(response);
        }
        Ok(())
    }

    async fn replay(
        &self,
        script: &RecordedScript,
        events: &mpsc::UnboundedSender<ObservedResponse>,
    ) -> Result<()> {
        match script.first_navigate_url() {
            Some(url) => {
                let url = url.to_string();
                self.navigate(&url, events).await
            }
            None => Err(LynkeusError::ScriptError(
                "script contains no navigate step".to_string(),
            )),
        }
    }

    async fn close(&self) -> Result<()> {
        self.backend.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A response carrying no security headers at all
pub fn plain_response(url: &str) -> ObservedResponse {
    ObservedResponse::new(url, 200).with_header("content-type", "text/html")
}

/// A response with every bundled rule satisfied
pub fn hardened_response(url: &str) -> ObservedResponse {
    ObservedResponse::new(url, 200)
        .with_header("content-type", "text/html")
        .with_header("strict-transport-security", "max-age=31536000; includeSubDomains")
        .with_header("content-security-policy", "default-src 'self'")
        .with_header("x-frame-options", "DENY")
        .with_header("x-content-type-options", "nosniff")
        .with_header("cache-control", "no-store")
        .with_header("referrer-policy", "strict-origin-when-cross-origin")
        .with_header("permissions-policy", "camera=(), microphone=()")
        .with_header("set-cookie", "sid=abc; Secure; HttpOnly; SameSite=Lax")
}
