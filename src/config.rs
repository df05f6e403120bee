//! Configuration management for Lynkeus

use crate::aggregate::RiskThresholds;
use crate::error::Result;
use crate::orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Engine-wide tuning, merged from code defaults, an optional TOML file,
/// and CLI arguments
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Default session concurrency when the job carries no hint
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub retry_limit: u32,
    pub retry_delay_ms: u64,
    pub navigation_timeout_secs: u64,
    /// Membership filter capacity (expected distinct URLs per job)
    pub filter_capacity: usize,
    /// Membership filter target false-positive rate
    pub filter_error_rate: f64,
    /// Cap on URLs kept per pass/fail list in a rule summary
    pub max_listed_urls: usize,
    pub medium_for_high: usize,
    pub medium_for_medium: usize,
    pub low_for_medium: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        let thresholds = RiskThresholds::default();
        Self {
            concurrency: 10,
            queue_capacity: 256,
            retry_limit: 3,
            retry_delay_ms: 1000,
            navigation_timeout_secs: 60,
            filter_capacity: 10_000,
            filter_error_rate: 0.01,
            max_listed_urls: 50,
            medium_for_high: thresholds.medium_for_high,
            medium_for_medium: thresholds.medium_for_medium,
            low_for_medium: thresholds.low_for_medium,
        }
    }
}

impl ScanSettings {
    /// Orchestrator knobs for one job; a non-zero job concurrency hint
    /// overrides the configured default
    pub fn orchestrator_config(&self, concurrency_hint: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: if concurrency_hint > 0 {
                concurrency_hint
            } else {
                self.concurrency
            },
            queue_capacity: self.queue_capacity,
            retry_limit: self.retry_limit,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
        }
    }

    pub fn thresholds(&self) -> RiskThresholds {
        RiskThresholds {
            medium_for_high: self.medium_for_high,
            medium_for_medium: self.medium_for_medium,
            low_for_medium: self.low_for_medium,
        }
    }
}

/// File-based configuration structure matching default.toml
#[derive(Debug, Deserialize)]
struct FileConfig {
    scan: Option<ScanSection>,
    filter: Option<FilterSection>,
    risk: Option<RiskSection>,
}

#[derive(Debug, Deserialize)]
struct ScanSection {
    concurrency: Option<usize>,
    queue_capacity: Option<usize>,
    retry_limit: Option<u32>,
    retry_delay_ms: Option<u64>,
    navigation_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilterSection {
    capacity: Option<usize>,
    error_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RiskSection {
    max_listed_urls: Option<usize>,
    medium_for_high: Option<usize>,
    medium_for_medium: Option<usize>,
    low_for_medium: Option<usize>,
}

/// Loads configuration from a TOML file and merges with defaults
pub fn load_config(path: &Path) -> Result<ScanSettings> {
    let content = std::fs::read_to_string(path)?;
    let file_config: FileConfig = toml::from_str(&content)?;

    let mut settings = ScanSettings::default();

    if let Some(scan) = file_config.scan {
        if let Some(concurrency) = scan.concurrency {
            settings.concurrency = concurrency;
        }
        if let Some(capacity) = scan.queue_capacity {
            settings.queue_capacity = capacity;
        }
        if let Some(limit) = scan.retry_limit {
            settings.retry_limit = limit;
        }
        if let Some(delay) = scan.retry_delay_ms {
            settings.retry_delay_ms = delay;
        }
        if let Some(timeout) = scan.navigation_timeout_secs {
            settings.navigation_timeout_secs = timeout;
        }
    }

    if let Some(filter) = file_config.filter {
        if let Some(capacity) = filter.capacity {
            settings.filter_capacity = capacity;
        }
        if let Some(rate) = filter.error_rate {
            settings.filter_error_rate = rate;
        }
    }

    if let Some(risk) = file_config.risk {
        if let Some(max) = risk.max_listed_urls {
            settings.max_listed_urls = max;
        }
        if let Some(threshold) = risk.medium_for_high {
            settings.medium_for_high = threshold;
        }
        if let Some(threshold) = risk.medium_for_medium {
            settings.medium_for_medium = threshold;
        }
        if let Some(threshold) = risk.low_for_medium {
            settings.low_for_medium = threshold;
        }
    }

    Ok(settings)
}

/// Merges CLI arguments into existing settings
pub fn merge_cli_args(
    settings: &mut ScanSettings,
    concurrency: Option<usize>,
    timeout: Option<u64>,
    retry_limit: Option<u32>,
) {
    if let Some(c) = concurrency {
        settings.concurrency = c;
    }
    if let Some(t) = timeout {
        settings.navigation_timeout_secs = t;
    }
    if let Some(r) = retry_limit {
        settings.retry_limit = r;
    }
}
