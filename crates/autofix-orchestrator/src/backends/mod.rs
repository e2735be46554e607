//! Fixer backends and the pieces they share.

use std::time::{Duration, Instant};

use autofix_core::{truncate_chars, FixDescriptor, Issue};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::VerificationConfig;
use crate::error::{millis, BackendError};
use crate::process::ProcessRunner;

pub mod claude;
pub mod ollama;

pub use claude::ClaudeBackend;
pub use ollama::{OllamaBackend, OllamaCli};

const RESPONSE_EXCERPT_CHARS: usize = 100;

/// Result of re-running the failing test after a fix was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified { response: String },
    Mismatch { response: String },
}

/// A remediation provider. Each call may block; the orchestrator bounds it with
/// its own deadline.
pub trait FixerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Ask for a fix descriptor given the issue and the historical digest.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the provider cannot be reached, fails, or
    /// answers without a usable descriptor.
    fn analyze(&self, issue: &Issue, context: &str) -> Result<FixDescriptor, BackendError>;

    /// Run the descriptor's commands in order, stopping at the first failure.
    ///
    /// # Errors
    /// Returns [`BackendError`] for the first command that fails or times out.
    fn apply(&self, fix: &FixDescriptor) -> Result<(), BackendError>;

    /// Re-run the issue's test prompt and compare the reply with its expected pattern.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the test itself cannot be run; a reply that
    /// does not match is [`Verification::Mismatch`], not an error.
    fn verify(&self, issue: &Issue, fix: &FixDescriptor) -> Result<Verification, BackendError>;
}

/// Apply a descriptor's commands. A descriptor without a `fix_commands` key
/// is refused; an explicit empty list applies trivially.
///
/// # Errors
/// Returns [`BackendError::MissingCommands`] when the key was absent, otherwise
/// whatever [`apply_commands`] returns.
pub fn apply_fix(
    runner: &ProcessRunner,
    fix: &FixDescriptor,
    timeout: Duration,
) -> Result<(), BackendError> {
    let Some(commands) = fix.fix_commands.as_deref() else {
        warn!(fix_type = ?fix.fix_type, "fix descriptor has no fix_commands; refusing to apply");
        return Err(BackendError::MissingCommands);
    };
    apply_commands(runner, commands, timeout)
}

/// Execute each command through `bash -c`, in order, within one shared deadline.
///
/// # Errors
/// Returns [`BackendError::CommandFailed`] for the first non-zero exit and
/// [`BackendError::Timeout`] when the deadline passes.
pub fn apply_commands(
    runner: &ProcessRunner,
    commands: &[String],
    timeout: Duration,
) -> Result<(), BackendError> {
    if commands.is_empty() {
        info!("fix descriptor has no commands; nothing to apply");
        return Ok(());
    }

    let timed_out = || BackendError::Timeout {
        after_ms: millis(timeout),
    };
    let deadline = Instant::now() + timeout;
    for (index, command) in commands.iter().enumerate() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }

        info!(
            step = index + 1,
            total = commands.len(),
            command = %command,
            "applying fix command"
        );
        let mut bash = Command::new("bash");
        bash.arg("-c").arg(command);
        let output = runner.run(bash, None, remaining).map_err(|err| match err {
            BackendError::Timeout { .. } => timed_out(),
            other => other,
        })?;

        if !output.success() {
            warn!(command = %command, status = %output.status_label(), "fix command failed");
            return Err(BackendError::CommandFailed {
                command: command.clone(),
                status: output.status_label(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        debug!(command = %command, stdout = %output.stdout.trim(), "fix command succeeded");
    }
    Ok(())
}

/// Re-runs an issue's test prompt against the model under test through Ollama.
#[derive(Debug, Clone)]
pub struct OllamaVerifier {
    cli: OllamaCli,
    defaults: VerificationConfig,
    timeout: Duration,
}

impl OllamaVerifier {
    #[must_use]
    pub fn new(cli: OllamaCli, defaults: VerificationConfig, timeout: Duration) -> Self {
        Self {
            cli,
            defaults,
            timeout,
        }
    }

    /// # Errors
    /// Returns [`BackendError::Pattern`] for an invalid expected pattern, and the
    /// process error or timeout when the model cannot be run.
    pub fn verify(&self, issue: &Issue) -> Result<Verification, BackendError> {
        let prompt = issue
            .test_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
            .unwrap_or(self.defaults.default_prompt.as_str());
        let pattern = issue
            .expected_pattern
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .unwrap_or(self.defaults.default_pattern.as_str());

        let matcher = regex_lite::Regex::new(pattern).map_err(|err| BackendError::Pattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;

        let response = self.cli.run_prompt(&issue.model, prompt, self.timeout)?;
        let response = response.trim().to_string();
        let excerpt = truncate_chars(&response, RESPONSE_EXCERPT_CHARS).to_string();

        if matcher.is_match(&response) {
            info!(model = %issue.model, response = %excerpt, "fix verified");
            Ok(Verification::Verified { response: excerpt })
        } else {
            warn!(
                model = %issue.model,
                pattern,
                response = %excerpt,
                "response does not match expected pattern"
            );
            Ok(Verification::Mismatch { response: excerpt })
        }
    }
}
