//! Anthropic Messages API as the fixer.

use autofix_core::{FixDescriptor, Issue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{apply_fix, FixerBackend, OllamaCli, OllamaVerifier, Verification};
use crate::config::{AutofixConfig, StageTimeouts};
use crate::error::{BackendError, ConfigurationError};
use crate::process::ProcessRunner;
use crate::prompt::render_analysis_prompt;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

pub struct ClaudeBackend {
    agent: ureq::Agent,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    timeouts: StageTimeouts,
    runner: ProcessRunner,
    verifier: OllamaVerifier,
}

impl ClaudeBackend {
    /// Build from configuration, reading the API key through `lookup_env`.
    ///
    /// # Errors
    /// Returns [`ConfigurationError::MissingCredential`] when the key variable is
    /// unset or blank, and [`ConfigurationError::Runtime`] when commands cannot be run.
    pub fn from_config(
        config: &AutofixConfig,
        lookup_env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let variable = &config.claude.api_key_env;
        let api_key = lookup_env(variable)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigurationError::MissingCredential {
                variable: variable.clone(),
            })?;

        let agent = ureq::AgentBuilder::new().timeout(config.timeouts.analyze()).build();
        let runner = ProcessRunner::new()?;
        let verifier = OllamaVerifier::new(
            OllamaCli::new(config.ollama.binary.clone(), runner.clone()),
            config.verification.clone(),
            config.timeouts.verify(),
        );

        Ok(Self {
            agent,
            api_url: config.claude.api_url.clone(),
            api_key,
            model: config.claude.model.clone(),
            max_tokens: config.claude.max_tokens,
            timeouts: config.timeouts,
            runner,
            verifier,
        })
    }

    fn request_completion(&self, prompt: &str) -> Result<String, BackendError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = match self
            .agent
            .post(&self.api_url)
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", ANTHROPIC_VERSION)
            .set("content-type", "application/json")
            .send_json(&request)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                warn!(status = code, "claude api returned an error status");
                return Err(BackendError::Http(format!("HTTP {code}: {}", body.trim())));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(BackendError::Http(transport.to_string()));
            }
        };

        let parsed: MessagesResponse = response
            .into_json()
            .map_err(|err| BackendError::Malformed(format!("unreadable api response: {err}")))?;
        parsed
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .ok_or_else(|| BackendError::Malformed("api response has no content".to_string()))
    }
}

impl FixerBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    fn analyze(&self, issue: &Issue, context: &str) -> Result<FixDescriptor, BackendError> {
        let prompt = render_analysis_prompt(issue, context);
        debug!(model = %self.model, prompt_chars = prompt.len(), "requesting claude analysis");
        let text = self.request_completion(&prompt)?;
        FixDescriptor::from_model_output(&text)
            .map_err(|err| BackendError::Malformed(err.to_string()))
    }

    fn apply(&self, fix: &FixDescriptor) -> Result<(), BackendError> {
        apply_fix(&self.runner, fix, self.timeouts.apply())
    }

    fn verify(&self, issue: &Issue, _fix: &FixDescriptor) -> Result<Verification, BackendError> {
        self.verifier.verify(issue)
    }
}
