//! Result aggregation and risk classification
//!
//! Folds every (rule, verdict, response) observation into one summary per
//! rule, then classifies the overall risk from the distribution of failing
//! rules per tier. The summary map is owned here and lock-guarded; tasks
//! record concurrently.

use crate::models::{ObservedResponse, RiskLevel, RuleSummary, RuleVerdict, Verdict};
use crate::rules;
use std::collections::HashMap;
use std::sync::Mutex;

/// Classification thresholds. Each bound is "strictly more than"; they are
/// configuration, not control flow.
#[derive(Debug, Clone)]
pub struct RiskThresholds {
    /// Failing medium-tier rules needed to escalate to High
    pub medium_for_high: usize,
    /// Failing medium-tier rules needed to reach Medium
    pub medium_for_medium: usize,
    /// Failing low-tier rules needed to reach Medium
    pub low_for_medium: usize,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium_for_high: 2,
            medium_for_medium: 0,
            low_for_medium: 3,
        }
    }
}

/// Ordered, top-down classification - the first matching tier wins
pub fn classify(summaries: &[RuleSummary], thresholds: &RiskThresholds) -> RiskLevel {
    let failing = |risk: RiskLevel| {
        summaries
            .iter()
            .filter(|s| s.risk == risk && s.fail_count > 0)
            .count()
    };

    if failing(RiskLevel::Critical) > 0 {
        RiskLevel::Critical
    } else if failing(RiskLevel::High) > 0 || failing(RiskLevel::Medium) > thresholds.medium_for_high
    {
        RiskLevel::High
    } else if failing(RiskLevel::Medium) > thresholds.medium_for_medium
        || failing(RiskLevel::Low) > thresholds.low_for_medium
    {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Everything `finalize` hands back to the engine
#[derive(Debug)]
pub struct AggregateOutcome {
    pub summaries: Vec<RuleSummary>,
    pub risk_level: RiskLevel,
    pub responses_evaluated: u64,
}

struct AggregatorState {
    summaries: HashMap<&'static str, RuleSummary>,
    responses_evaluated: u64,
}

/// Incremental per-rule aggregation for one scan job
pub struct Aggregator {
    state: Mutex<AggregatorState>,
    /// Cap on how many URLs each pass/fail list keeps
    max_listed_urls: usize,
}

impl Aggregator {
    pub fn new(max_listed_urls: usize) -> Self {
        Self {
            state: Mutex::new(AggregatorState {
                summaries: HashMap::new(),
                responses_evaluated: 0,
            }),
            max_listed_urls,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts one response as evaluated; called once per response that
    /// clears the dedup filter.
    pub fn note_response(&self) {
        self.lock().responses_evaluated += 1;
    }

    pub fn responses_evaluated(&self) -> u64 {
        self.lock().responses_evaluated
    }

    /// Updates exactly one rule summary: bumps the matching counter,
    /// appends the URL to the bounded list, and overwrites the last-seen
    /// header snapshot for that outcome kind.
    pub fn record(&self, verdict: &RuleVerdict, response: &ObservedResponse) {
        let mut state = self.lock();
        let summary = state
            .summaries
            .entry(verdict.v_type)
            .or_insert_with(|| summary_for(verdict.v_type));

        match verdict.verdict {
            Verdict::Pass => {
                summary.pass_count += 1;
                if summary.pass_urls.len() < self.max_listed_urls {
                    summary.pass_urls.push(verdict.url.clone());
                }
                summary.pass_headers = Some(response.headers.clone());
            }
            Verdict::Fail => {
                summary.fail_count += 1;
                if summary.fail_urls.len() < self.max_listed_urls {
                    summary.fail_urls.push(verdict.url.clone());
                }
                summary.fail_headers = Some(response.headers.clone());
            }
            Verdict::Indeterminate => {
                summary.indeterminate_count += 1;
            }
        }
    }

    /// Drains the summary map into catalogue order (every catalogue rule
    /// gets a summary, observed or not) and classifies the overall risk.
    /// Called once, after the orchestrator is idle.
    pub fn finalize(&self, thresholds: &RiskThresholds) -> AggregateOutcome {
        let mut state = self.lock();
        let mut collected = std::mem::take(&mut state.summaries);
        let responses_evaluated = state.responses_evaluated;
        drop(state);

        let mut summaries: Vec<RuleSummary> = rules::catalogue()
            .iter()
            .map(|rule| {
                collected
                    .remove(rule.v_type)
                    .unwrap_or_else(|| RuleSummary::new(rule.v_type, rule.name, rule.risk))
            })
            .collect();

        // Verdicts recorded outside the bundled catalogue keep a stable tail
        let mut extras: Vec<RuleSummary> = collected.into_values().collect();
        extras.sort_by(|a, b| a.v_type.cmp(&b.v_type));
        summaries.extend(extras);

        let risk_level = classify(&summaries, thresholds);
        AggregateOutcome {
            summaries,
            risk_level,
            responses_evaluated,
        }
    }
}

fn summary_for(v_type: &str) -> RuleSummary {
    match rules::catalogue().iter().find(|r| r.v_type == v_type) {
        Some(rule) => RuleSummary::new(rule.v_type, rule.name, rule.risk),
        None => RuleSummary::new(v_type, v_type, RiskLevel::Low),
    }
}
