//! Core data models for Lynkeus

use crate::session::replay::RecordedScript;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Lowercased header name -> every value received for it
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// Ordinal risk tier attached to a rule and to a finished scan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Outcome of one rule applied to one observed response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
    /// The rule predicate itself failed; counted separately, never retried
    Indeterminate,
}

/// One HTTP response seen during a browser session.
///
/// Ephemeral: exists only for the duration of rule evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedResponse {
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
}

impl ObservedResponse {
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Appends a header value, lowercasing the name
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// Returns the first value of a header, if present
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// Returns every value received for a header
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// The pass/fail outcome of one rule against one response URL
#[derive(Debug, Clone)]
pub struct RuleVerdict {
    pub v_type: &'static str,
    pub url: String,
    pub verdict: Verdict,
}

/// Per-rule aggregation, mutated incrementally for the lifetime of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSummary {
    pub v_type: String,
    pub name: String,
    pub risk: RiskLevel,
    pub pass_count: u64,
    pub fail_count: u64,
    pub indeterminate_count: u64,
    /// Passing URLs, capped at the aggregator's list bound
    pub pass_urls: Vec<String>,
    /// Failing URLs, capped at the aggregator's list bound
    pub fail_urls: Vec<String>,
    /// Headers of the most recent passing response
    pub pass_headers: Option<HeaderMap>,
    /// Headers of the most recent failing response
    pub fail_headers: Option<HeaderMap>,
}

impl RuleSummary {
    pub fn new(v_type: impl Into<String>, name: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            v_type: v_type.into(),
            name: name.into(),
            risk,
            pass_count: 0,
            fail_count: 0,
            indeterminate_count: 0,
            pass_urls: Vec::new(),
            fail_urls: Vec::new(),
            pass_headers: None,
            fail_headers: None,
        }
    }
}

/// A crawl target that exhausted its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTarget {
    pub url: String,
    pub attempts: u32,
    pub error: String,
}

/// Descriptive metadata handed through to the report collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMeta {
    pub report_name: String,
    pub version: String,
    pub target_system: String,
    pub start_date: String,
    pub end_date: String,
}

/// Job lifecycle states surfaced to the persistence collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A key/value pair seeded into localStorage before any page script runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageItem {
    pub name: String,
    pub value: String,
}

/// One end-to-end request to assess a target site.
///
/// Immutable once the engine starts it.
#[derive(Debug, Clone)]
pub struct ScanJob {
    pub scan_id: String,
    pub target: String,
    /// Recorded interaction script replayed instead of a plain navigation
    pub script: Option<RecordedScript>,
    /// Maximum concurrent browser sessions
    pub concurrency: usize,
    /// Extra request headers injected into every session
    pub headers: HashMap<String, String>,
    /// localStorage entries seeded before any page script runs
    pub local_storage: Vec<StorageItem>,
    pub report: ReportMeta,
}

impl ScanJob {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            scan_id: uuid::Uuid::new_v4().to_string(),
            target: target.into(),
            script: None,
            concurrency: 10,
            headers: HashMap::new(),
            local_storage: Vec::new(),
            report: ReportMeta::default(),
        }
    }
}

/// Finalized output of a scan job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_id: String,
    pub target: String,
    pub report: ReportMeta,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub risk_level: RiskLevel,
    /// One summary per catalogue rule, in catalogue order
    pub summaries: Vec<RuleSummary>,
    pub responses_evaluated: u64,
    pub failed_targets: Vec<FailedTarget>,
}

impl ScanResult {
    /// Returns the number of failing rules at the given tier
    pub fn failing_rules_at(&self, risk: RiskLevel) -> usize {
        self.summaries
            .iter()
            .filter(|s| s.risk == risk && s.fail_count > 0)
            .count()
    }
}
