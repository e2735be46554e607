use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub mod attempt;
pub mod context;
pub mod knowledge;

pub use attempt::{AttemptState, AttemptTrace, StageFailure};
pub use context::{render_historical_context, HistoricalContext, CONTEXT_FOOTER, CONTEXT_HEADER};
pub use knowledge::{KnowledgeBase, KNOWLEDGE_BASE_VERSION, MAX_MODEL_TIPS};

/// Number of leading prompt characters that participate in the issue signature.
pub const SIGNATURE_PROMPT_CHARS: usize = 50;
/// Hex characters kept from the signature digest.
pub const SIGNATURE_HEX_LEN: usize = 16;
/// Number of raw history rows returned with model insights.
pub const RECENT_HISTORY_LIMIT: usize = 10;
/// Characters of analysis kept in a model history entry.
pub const HISTORY_ANALYSIS_CHARS: usize = 100;
/// Upper bound for the distinct lists kept on a model aggregate.
pub const MAX_AGGREGATE_ENTRIES: usize = 10;

const EFFECTIVE_FIX_ANALYSIS_CHARS: usize = 60;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid attempt transition: {from} -> {to}")]
    Transition {
        from: AttemptState,
        to: AttemptState,
    },
}

/// Return the longest prefix of `value` holding at most `max_chars` characters.
#[must_use]
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &value[..byte_index],
        None => value,
    }
}

/// Model family is everything before the first `:` of the model identifier.
#[must_use]
pub fn model_family(model: &str) -> &str {
    model.split_once(':').map_or(model, |(family, _)| family)
}

/// An observed failure submitted for remediation.
///
/// Field names follow the test harness' issue files; camelCase aliases are
/// accepted as well.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub model: String,
    #[serde(alias = "issueType")]
    pub issue_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "errorOutput", skip_serializing_if = "Option::is_none")]
    pub error_output: Option<String>,
    #[serde(default, alias = "testPrompt", skip_serializing_if = "Option::is_none")]
    pub test_prompt: Option<String>,
    #[serde(default, alias = "expectedPattern", skip_serializing_if = "Option::is_none")]
    pub expected_pattern: Option<String>,
    #[serde(default, alias = "actualResponse", skip_serializing_if = "Option::is_none")]
    pub actual_response: Option<String>,
    #[serde(default, alias = "test_environment", alias = "testEnvironment")]
    pub environment: BTreeMap<String, Value>,
}

impl Issue {
    #[must_use]
    pub fn new(model: impl Into<String>, issue_type: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            issue_type: issue_type.into(),
            description: String::new(),
            error_output: None,
            test_prompt: None,
            expected_pattern: None,
            actual_response: None,
            environment: BTreeMap::new(),
        }
    }

    /// Check the fields every attempt depends on.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the model or issue type is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.model.trim().is_empty() {
            return Err(CoreError::Validation("issue model MUST be provided".to_string()));
        }
        if self.issue_type.trim().is_empty() {
            return Err(CoreError::Validation("issue type MUST be provided".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn signature(&self) -> IssueSignature {
        IssueSignature::for_issue(self)
    }

    /// Parse an issue descriptor document.
    ///
    /// # Errors
    /// Returns [`CoreError::Parse`] for malformed JSON and
    /// [`CoreError::Validation`] when required fields are blank.
    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        let issue: Self =
            serde_json::from_str(raw).map_err(|err| CoreError::Parse(err.to_string()))?;
        issue.validate()?;
        Ok(issue)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ResponseLengthBucket {
    Empty,
    Short,
    Medium,
    Long,
    VeryLong,
}

impl ResponseLengthBucket {
    #[must_use]
    pub fn for_len(chars: usize) -> Self {
        match chars {
            0 => Self::Empty,
            1..=49 => Self::Short,
            50..=199 => Self::Medium,
            200..=999 => Self::Long,
            _ => Self::VeryLong,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "0",
            Self::Short => "1-49",
            Self::Medium => "50-199",
            Self::Long => "200-999",
            Self::VeryLong => "1000+",
        }
    }
}

/// Deterministic digest identifying exact-duplicate issues.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct IssueSignature(String);

impl IssueSignature {
    #[must_use]
    pub fn for_issue(issue: &Issue) -> Self {
        let prompt = issue.test_prompt.as_deref().unwrap_or_default();
        let response_chars =
            issue.actual_response.as_deref().map_or(0, |response| response.chars().count());
        let material = [
            issue.issue_type.as_str(),
            model_family(&issue.model),
            truncate_chars(prompt, SIGNATURE_PROMPT_CHARS),
            ResponseLengthBucket::for_len(response_chars).as_str(),
        ]
        .join("|");

        let digest = Sha256::digest(material.as_bytes());
        let mut encoded = hex::encode(digest);
        encoded.truncate(SIGNATURE_HEX_LEN);
        Self(encoded)
    }

    /// Wrap a stored signature.
    ///
    /// # Errors
    /// Returns [`CoreError::Parse`] unless the value is 16 lowercase hex characters.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let well_formed = raw.len() == SIGNATURE_HEX_LEN
            && raw.chars().all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
        if !well_formed {
            return Err(CoreError::Parse(format!("invalid issue signature: {raw}")));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for IssueSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remediation proposal returned by an analysis backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FixDescriptor {
    #[serde(default)]
    pub analysis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_type: Option<String>,
    /// `None` when the reply carried no `fix_commands` key, which cannot be applied.
    /// An explicit empty list is a fix that needs no commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_commands: Option<Vec<String>>,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
}

impl FixDescriptor {
    /// Commands to run, empty when none were given.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        self.fix_commands.as_deref().unwrap_or_default()
    }

    /// Extract the JSON object embedded in free-form model output.
    ///
    /// The object spans from the first `{` to the last `}`; surrounding prose
    /// and code fences are ignored.
    ///
    /// # Errors
    /// Returns [`CoreError::Parse`] when no object is present, it does not
    /// deserialize, or it carries no analysis.
    pub fn from_model_output(raw: &str) -> Result<Self, CoreError> {
        let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
            return Err(CoreError::Parse("model output contains no JSON object".to_string()));
        };
        if end < start {
            return Err(CoreError::Parse("model output contains no JSON object".to_string()));
        }

        let descriptor: Self = serde_json::from_str(&raw[start..=end])
            .map_err(|err| CoreError::Parse(format!("fix descriptor is not valid JSON: {err}")))?;
        if descriptor.analysis.trim().is_empty() {
            return Err(CoreError::Parse("fix descriptor has no analysis".to_string()));
        }
        Ok(descriptor)
    }
}

/// The two outcome flags persisted with every attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptOutcome {
    pub fix_applied: bool,
    pub verified: bool,
}

impl AttemptOutcome {
    pub const NOT_APPLIED: Self = Self {
        fix_applied: false,
        verified: false,
    };
    pub const APPLIED_UNVERIFIED: Self = Self {
        fix_applied: true,
        verified: false,
    };
    pub const VERIFIED: Self = Self {
        fix_applied: true,
        verified: true,
    };

    /// # Errors
    /// Returns [`CoreError::Validation`] for `verified` without `fix_applied`.
    pub fn validate(self) -> Result<(), CoreError> {
        if self.verified && !self.fix_applied {
            return Err(CoreError::Validation(
                "verified attempts MUST have the fix applied".to_string(),
            ));
        }
        Ok(())
    }

    /// Success as used by ordering, aggregates and the knowledge base.
    #[must_use]
    pub fn is_success(self) -> bool {
        self.fix_applied
    }
}

/// One recorded analyze/apply/verify cycle. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub model: String,
    pub issue_type: String,
    pub signature: IssueSignature,
    pub description: String,
    pub backend: String,
    pub analysis: String,
    pub commands: Vec<String>,
    pub fix_applied: bool,
    pub verified: bool,
    pub duration_seconds: f64,
    pub environment: BTreeMap<String, Value>,
    pub notes: Option<String>,
}

impl FixAttempt {
    #[must_use]
    pub fn outcome(&self) -> AttemptOutcome {
        AttemptOutcome {
            fix_applied: self.fix_applied,
            verified: self.verified,
        }
    }
}

/// Per-model aggregate maintained incrementally as attempts are recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelCharacteristics {
    pub model: String,
    pub total_tests: u64,
    pub successful_tests: u64,
    pub success_rate: f64,
    pub common_issues: Vec<String>,
    pub effective_fixes: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub performance_notes: Option<String>,
}

impl ModelCharacteristics {
    #[must_use]
    pub fn empty(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            total_tests: 0,
            successful_tests: 0,
            success_rate: 0.0,
            common_issues: Vec::new(),
            effective_fixes: Vec::new(),
            last_updated: None,
            performance_notes: None,
        }
    }

    /// Fold one attempt into the aggregate.
    pub fn absorb(
        &mut self,
        issue_type: &str,
        fix: &FixDescriptor,
        outcome: AttemptOutcome,
        now: OffsetDateTime,
    ) {
        self.total_tests += 1;
        if outcome.is_success() {
            self.successful_tests += 1;
        }
        self.success_rate = success_rate(self.successful_tests, self.total_tests);

        push_distinct_bounded(&mut self.common_issues, issue_type, MAX_AGGREGATE_ENTRIES);

        if outcome.is_success() {
            let effective = fix.commands().first().map_or_else(
                || truncate_chars(&fix.analysis, EFFECTIVE_FIX_ANALYSIS_CHARS).to_string(),
                Clone::clone,
            );
            if !effective.trim().is_empty() {
                push_distinct_bounded(&mut self.effective_fixes, &effective, MAX_AGGREGATE_ENTRIES);
            }
        }

        self.last_updated = Some(now);
    }
}

fn push_distinct_bounded(values: &mut Vec<String>, value: &str, cap: usize) {
    if values.iter().any(|existing| existing == value) {
        return;
    }
    values.push(value.to_string());
    if values.len() > cap {
        let excess = values.len() - cap;
        values.drain(..excess);
    }
}

/// `successful / total`, or exactly `0.0` when nothing was attempted.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn success_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub issue_type: String,
    pub success: bool,
    pub analysis: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelInsights {
    #[serde(flatten)]
    pub characteristics: ModelCharacteristics,
    pub recent_history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SimilarIssues {
    pub exact_matches: Vec<FixAttempt>,
    pub model_matches: Vec<FixAttempt>,
    pub type_matches: Vec<FixAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_fixes_attempted: u64,
    pub successful_fixes: u64,
    pub success_rate: f64,
    pub models_encountered: u64,
    pub issue_types_seen: u64,
    #[serde(rename = "recentActivity7days")]
    pub recent_activity_7_days: u64,
    pub knowledge_base_size: u64,
    pub memory_directory: String,
}

/// Point-in-time export of everything the memory has learned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsightsSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub statistics: MemoryStats,
    pub knowledge_base: KnowledgeBase,
    pub model_insights: BTreeMap<String, ModelInsights>,
}
