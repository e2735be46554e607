//! Continuously updated summary of what has worked, per issue type and model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::{truncate_chars, AttemptOutcome, CoreError};

pub const KNOWLEDGE_BASE_VERSION: &str = "1.0";
/// Sliding-window size of the per-model tip list.
pub const MAX_MODEL_TIPS: usize = 10;

const TIP_ANALYSIS_CHARS: usize = 80;
const STRATEGY_ANALYSIS_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBase {
    #[serde(default)]
    pub general_patterns: BTreeMap<String, Value>,
    #[serde(default)]
    pub model_specific_tips: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub successful_strategies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub failure_patterns: BTreeMap<String, Value>,
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl KnowledgeBase {
    #[must_use]
    pub fn empty(now: OffsetDateTime) -> Self {
        Self {
            general_patterns: BTreeMap::new(),
            model_specific_tips: BTreeMap::new(),
            successful_strategies: BTreeMap::new(),
            failure_patterns: BTreeMap::new(),
            version: KNOWLEDGE_BASE_VERSION.to_string(),
            last_updated: now,
        }
    }

    /// Parse a persisted knowledge base document.
    ///
    /// # Errors
    /// Returns [`CoreError::Parse`] when the document is not valid JSON for this shape.
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|err| CoreError::Parse(format!("invalid knowledge base document: {err}")))
    }

    /// Learn from one recorded attempt.
    pub fn absorb_attempt(
        &mut self,
        model: &str,
        issue_type: &str,
        analysis: &str,
        outcome: AttemptOutcome,
        now: OffsetDateTime,
    ) {
        let success = outcome.is_success();
        let label = if success { "Success" } else { "Failed" };
        let tip = format!(
            "{issue_type}: {label} - {}",
            truncate_chars(analysis, TIP_ANALYSIS_CHARS)
        );

        let tips = self.model_specific_tips.entry(model.to_string()).or_default();
        tips.push(tip);
        if tips.len() > MAX_MODEL_TIPS {
            let excess = tips.len() - MAX_MODEL_TIPS;
            tips.drain(..excess);
        }

        if success {
            let strategy = truncate_chars(analysis, STRATEGY_ANALYSIS_CHARS).to_string();
            let strategies = self.successful_strategies.entry(issue_type.to_string()).or_default();
            if !strategies.contains(&strategy) {
                strategies.push(strategy);
            }
        }

        self.last_updated = now;
    }

    #[must_use]
    pub fn strategies_for(&self, issue_type: &str) -> &[String] {
        self.successful_strategies.get(issue_type).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn tips_for(&self, model: &str) -> &[String] {
        self.model_specific_tips.get(model).map(Vec::as_slice).unwrap_or_default()
    }
}
