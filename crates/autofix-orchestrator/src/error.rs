//! Error types surfaced by backend selection, backend calls and attempt runs.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Problems detected before an attempt starts. Always fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unknown backend `{name}`; known backends: {known}")]
    UnknownBackend { name: String, known: String },
    #[error("missing credential: set the {variable} environment variable")]
    MissingCredential { variable: String },
    #[error("backend `{backend}` is unavailable: {help}")]
    Unavailable { backend: String, help: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to load configuration from {path}: {reason}")]
    File { path: PathBuf, reason: String },
    #[error("invalid issue: {0}")]
    InvalidIssue(String),
    #[error("failed to start process runtime: {0}")]
    Runtime(String),
}

/// Failure of a single backend call. Converted into a stage failure by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("http request failed: {0}")]
    Http(String),
    #[error("process failed: {0}")]
    Process(String),
    #[error("command `{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("malformed fix descriptor: {0}")]
    Malformed(String),
    #[error("invalid expected pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("fix descriptor provides no fix_commands")]
    MissingCommands,
}

impl BackendError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Errors returned from [`crate::Orchestrator::run`]. Stage failures are not
/// errors; they are reported inside the attempt report.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to persist attempt: {0:#}")]
    Persistence(anyhow::Error),
}
