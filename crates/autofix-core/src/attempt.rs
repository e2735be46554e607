//! States of a single remediation attempt and the ways it can stop early.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{AttemptOutcome, CoreError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Init,
    Analyzing,
    AnalysisFailed,
    Analyzed,
    Applying,
    ApplyFailed,
    Applied,
    Verifying,
    Verified,
    VerifyFailed,
}

impl AttemptState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Analyzing => "analyzing",
            Self::AnalysisFailed => "analysis_failed",
            Self::Analyzed => "analyzed",
            Self::Applying => "applying",
            Self::ApplyFailed => "apply_failed",
            Self::Applied => "applied",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::VerifyFailed => "verify_failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AnalysisFailed | Self::ApplyFailed | Self::Verified | Self::VerifyFailed
        )
    }

    /// Outcome flags recorded for a terminal state, `None` otherwise.
    #[must_use]
    pub fn outcome(self) -> Option<AttemptOutcome> {
        match self {
            Self::AnalysisFailed | Self::ApplyFailed => Some(AttemptOutcome::NOT_APPLIED),
            Self::VerifyFailed => Some(AttemptOutcome::APPLIED_UNVERIFIED),
            Self::Verified => Some(AttemptOutcome::VERIFIED),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Analyzing)
                | (Self::Analyzing, Self::AnalysisFailed | Self::Analyzed)
                | (Self::Analyzed, Self::Applying)
                | (Self::Applying, Self::ApplyFailed | Self::Applied)
                | (Self::Applied, Self::Verifying)
                | (Self::Verifying, Self::Verified | Self::VerifyFailed)
        )
    }
}

impl Display for AttemptState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear walk through [`AttemptState`], rejecting any skipped or repeated step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTrace {
    history: Vec<AttemptState>,
}

impl AttemptTrace {
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![AttemptState::Init],
        }
    }

    #[must_use]
    pub fn state(&self) -> AttemptState {
        self.history.last().copied().unwrap_or(AttemptState::Init)
    }

    #[must_use]
    pub fn history(&self) -> &[AttemptState] {
        &self.history
    }

    /// # Errors
    /// Returns [`CoreError::Transition`] when `next` is not reachable from the current state.
    pub fn advance(&mut self, next: AttemptState) -> Result<(), CoreError> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(CoreError::Transition {
                from: current,
                to: next,
            });
        }
        self.history.push(next);
        Ok(())
    }
}

impl Default for AttemptTrace {
    fn default() -> Self {
        Self::new()
    }
}

/// Why an attempt stopped before a verified fix. Rendered into the `notes` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    #[error("analysis failed: {reason}")]
    AnalysisFailed { reason: String },
    #[error("analysis timed out after {after_ms}ms")]
    AnalysisTimeout { after_ms: u64 },
    #[error("analysis returned an unusable fix descriptor: {reason}")]
    MalformedDescriptor { reason: String },
    #[error("fix application failed: {reason}")]
    ApplyFailed { reason: String },
    #[error("fix application timed out after {after_ms}ms")]
    ApplyTimeout { after_ms: u64 },
    #[error("verification timed out after {after_ms}ms")]
    VerificationTimeout { after_ms: u64 },
    #[error("verification mismatch: {reason}")]
    VerificationMismatch { reason: String },
    #[error("verification failed: {reason}")]
    VerificationFailed { reason: String },
}

impl StageFailure {
    /// Terminal state this failure moves the attempt into.
    #[must_use]
    pub fn terminal_state(&self) -> AttemptState {
        match self {
            Self::AnalysisFailed { .. }
            | Self::AnalysisTimeout { .. }
            | Self::MalformedDescriptor { .. } => AttemptState::AnalysisFailed,
            Self::ApplyFailed { .. } | Self::ApplyTimeout { .. } => AttemptState::ApplyFailed,
            Self::VerificationTimeout { .. }
            | Self::VerificationMismatch { .. }
            | Self::VerificationFailed { .. } => AttemptState::VerifyFailed,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AnalysisTimeout { .. }
                | Self::ApplyTimeout { .. }
                | Self::VerificationTimeout { .. }
        )
    }
}
