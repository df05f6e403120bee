//! Browser session abstraction
//!
//! A session is an exclusive browser context acquired from the
//! orchestrator's pool. The concrete automation backend hides behind the
//! `SessionDriver`/`SessionFactory` traits so tests can run against an
//! in-process mock instead of a real browser.

pub mod browser;
pub mod replay;

use crate::error::Result;
use crate::models::ObservedResponse;
use async_trait::async_trait;
use replay::RecordedScript;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a task asks its session to do
#[derive(Debug, Clone)]
pub enum Navigation {
    /// Load a literal URL and wait for network quiescence
    Url(String),
    /// Replay a recorded interaction script, step by step
    Script(RecordedScript),
}

/// One browser session: navigation, response interception, teardown.
///
/// Sessions are checked out of the pool for exactly one task at a time and
/// always released, including on error.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Loads `url`, forwarding every observed response to `events`.
    /// Returns once the network has quiesced.
    async fn navigate(
        &self,
        url: &str,
        events: &mpsc::UnboundedSender<ObservedResponse>,
    ) -> Result<()>;

    /// Replays a recorded step sequence strictly in order
    async fn replay(
        &self,
        script: &RecordedScript,
        events: &mpsc::UnboundedSender<ObservedResponse>,
    ) -> Result<()>;

    /// Tears the session down and releases browser resources
    async fn close(&self) -> Result<()>;
}

/// Creates sessions for the orchestrator's pool
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn SessionDriver>>;
}

/// Dispatches one navigation against a session
pub async fn drive(
    session: &dyn SessionDriver,
    navigation: &Navigation,
    events: &mpsc::UnboundedSender<ObservedResponse>,
) -> Result<()> {
    match navigation {
        Navigation::Url(url) => session.navigate(url, events).await,
        Navigation::Script(script) => session.replay(script, events).await,
    }
}
