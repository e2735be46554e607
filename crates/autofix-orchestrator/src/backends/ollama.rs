//! Local fixer models served through the Ollama command line.

use std::time::Duration;

use autofix_core::{FixDescriptor, Issue};
use tokio::process::Command;
use tracing::{debug, info};

use super::{apply_fix, FixerBackend, OllamaVerifier, Verification};
use crate::config::{StageTimeouts, VerificationConfig};
use crate::error::{BackendError, ConfigurationError};
use crate::process::ProcessRunner;
use crate::prompt::render_analysis_prompt;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct OllamaCli {
    binary: String,
    runner: ProcessRunner,
}

impl OllamaCli {
    #[must_use]
    pub fn new(binary: impl Into<String>, runner: ProcessRunner) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    #[must_use]
    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Whether `ollama --version` runs successfully.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        let mut command = Command::new(&self.binary);
        command.arg("--version");
        self.runner.run(command, None, PROBE_TIMEOUT).is_ok_and(|output| output.success())
    }

    /// Raw `ollama list` output.
    ///
    /// # Errors
    /// Returns [`BackendError`] when the listing cannot be produced.
    pub fn list_models(&self) -> Result<String, BackendError> {
        let mut command = Command::new(&self.binary);
        command.arg("list");
        let output = self.runner.run(command, None, PROBE_TIMEOUT)?;
        if !output.success() {
            return Err(BackendError::Process(format!(
                "{} list exited with {}: {}",
                self.binary,
                output.status_label(),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// First of `candidates` that appears in the local model listing.
    #[must_use]
    pub fn first_installed(&self, candidates: &[String]) -> Option<String> {
        let listing = self.list_models().ok()?;
        candidates.iter().find(|candidate| listing.contains(candidate.as_str())).cloned()
    }

    /// Send `prompt` to `model` on stdin and return its stdout.
    ///
    /// # Errors
    /// Returns [`BackendError::Timeout`] past `timeout` and [`BackendError::Process`]
    /// for a non-zero exit.
    pub fn run_prompt(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, BackendError> {
        let mut command = Command::new(&self.binary);
        command.arg("run").arg(model);
        let output = self.runner.run(command, Some(prompt), timeout)?;
        if !output.success() {
            return Err(BackendError::Process(format!(
                "{} run {model} exited with {}: {}",
                self.binary,
                output.status_label(),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// A locally served coder model acting as the fixer.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    name: String,
    model: String,
    cli: OllamaCli,
    timeouts: StageTimeouts,
    verifier: OllamaVerifier,
}

impl OllamaBackend {
    /// Pick the first installed model among `candidates`.
    ///
    /// # Errors
    /// Returns [`ConfigurationError::Unavailable`] when none is installed.
    pub fn select(
        name: &str,
        cli: OllamaCli,
        candidates: &[String],
        timeouts: StageTimeouts,
        verification: VerificationConfig,
    ) -> Result<Self, ConfigurationError> {
        let Some(model) = cli.first_installed(candidates) else {
            let fallback = candidates.last().map_or("<model>", String::as_str);
            return Err(ConfigurationError::Unavailable {
                backend: name.to_string(),
                help: format!(
                    "none of [{}] is installed; run `{} pull {fallback}`",
                    candidates.join(", "),
                    cli.binary()
                ),
            });
        };
        info!(backend = name, model = %model, "selected local fixer model");
        Ok(Self::with_model(name, model, cli, timeouts, verification))
    }

    #[must_use]
    pub fn with_model(
        name: &str,
        model: impl Into<String>,
        cli: OllamaCli,
        timeouts: StageTimeouts,
        verification: VerificationConfig,
    ) -> Self {
        let verifier = OllamaVerifier::new(cli.clone(), verification, timeouts.verify());
        Self {
            name: name.to_string(),
            model: model.into(),
            cli,
            timeouts,
            verifier,
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl FixerBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&self, issue: &Issue, context: &str) -> Result<FixDescriptor, BackendError> {
        let prompt = render_analysis_prompt(issue, context);
        debug!(
            backend = %self.name,
            model = %self.model,
            prompt_chars = prompt.len(),
            "requesting analysis"
        );
        let reply = self.cli.run_prompt(&self.model, &prompt, self.timeouts.analyze())?;
        FixDescriptor::from_model_output(reply.trim())
            .map_err(|err| BackendError::Malformed(err.to_string()))
    }

    fn apply(&self, fix: &FixDescriptor) -> Result<(), BackendError> {
        apply_fix(self.cli.runner(), fix, self.timeouts.apply())
    }

    fn verify(&self, issue: &Issue, _fix: &FixDescriptor) -> Result<Verification, BackendError> {
        self.verifier.verify(issue)
    }
}
