//! Recorded interaction scripts
//!
//! The JSON shape produced by the Chrome DevTools recorder: a title and an
//! ordered step list. Steps replay strictly in order; viewport and raw key
//! steps are accepted but inert.

use crate::error::{LynkeusError, Result};
use serde::{Deserialize, Serialize};

/// A pre-recorded browser interaction to replay instead of a plain
/// navigation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedScript {
    #[serde(default)]
    pub title: String,
    pub steps: Vec<Step>,
}

/// One recorded step. Unknown step types are a fatal configuration error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Step {
    SetViewport {
        width: u32,
        height: u32,
    },
    Navigate {
        url: String,
    },
    /// Type a value into a form field
    Change {
        value: String,
        selectors: Vec<Vec<String>>,
    },
    Click {
        selectors: Vec<Vec<String>>,
    },
    DoubleClick {
        selectors: Vec<Vec<String>>,
    },
    KeyUp {
        key: String,
    },
    KeyDown {
        key: String,
    },
}

/// Element target resolved from a recorder selector list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// Structural path expression, preferred when recorded
    XPath(String),
    /// Plain CSS selector
    Css(String),
}

/// Picks the element target from a recorder selector list: an `xpath/`
/// expression anywhere in the list wins, else the first plain selector.
pub fn resolve_selector(selectors: &[Vec<String>]) -> Option<TargetSelector> {
    for group in selectors {
        for candidate in group {
            if let Some(xpath) = candidate.strip_prefix("xpath/") {
                return Some(TargetSelector::XPath(xpath.to_string()));
            }
        }
    }
    selectors
        .first()
        .and_then(|group| group.first())
        .map(|css| TargetSelector::Css(css.clone()))
}

impl RecordedScript {
    /// Parses and validates recorder JSON. Any failure here is fatal for
    /// the job - malformed scripts are never retried.
    pub fn from_json(raw: &str) -> Result<Self> {
        let script: RecordedScript =
            serde_json::from_str(raw).map_err(|e| LynkeusError::ScriptError(e.to_string()))?;
        script.validate()?;
        Ok(script)
    }

    /// Rejects scripts that cannot replay: no navigation at all, or a
    /// pointer/typing step without a usable selector.
    pub fn validate(&self) -> Result<()> {
        if !self
            .steps
            .iter()
            .any(|s| matches!(s, Step::Navigate { .. }))
        {
            return Err(LynkeusError::ScriptError(
                "script contains no navigate step".to_string(),
            ));
        }
        for (index, step) in self.steps.iter().enumerate() {
            let selectors = match step {
                Step::Change { selectors, .. }
                | Step::Click { selectors }
                | Step::DoubleClick { selectors } => selectors,
                _ => continue,
            };
            if resolve_selector(selectors).is_none() {
                return Err(LynkeusError::ScriptError(format!(
                    "step {index} has no usable selector"
                )));
            }
        }
        Ok(())
    }

    /// URL of the first navigate step
    pub fn first_navigate_url(&self) -> Option<&str> {
        self.steps.iter().find_map(|s| match s {
            Step::Navigate { url } => Some(url.as_str()),
            _ => None,
        })
    }
}
