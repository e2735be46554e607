use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub const MEMORY_DIR_ENV: &str = "AUTOFIX_MEMORY_DIR";

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_CLAUDE_MODEL: &str = "claude-3-5-sonnet-20241022";
const DEFAULT_VERIFY_PROMPT: &str = "What is 2+2? Answer briefly.";
const DEFAULT_VERIFY_PATTERN: &str = ".*4.*";

/// Everything a run needs besides the issue itself.
///
/// Values come from an optional YAML file, then [`MEMORY_DIR_ENV`], then
/// command-line flags applied by the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AutofixConfig {
    pub memory_dir: PathBuf,
    pub timeouts: StageTimeouts,
    pub claude: ClaudeConfig,
    pub ollama: OllamaConfig,
    pub verification: VerificationConfig,
}

/// Upper bounds for each blocking backend call, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StageTimeouts {
    pub analyze_secs: u64,
    pub apply_secs: u64,
    pub verify_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClaudeConfig {
    /// Name of the environment variable holding the API key. The key itself is
    /// never stored in configuration.
    pub api_key_env: String,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct OllamaConfig {
    pub binary: String,
    /// Candidates in preference order; the first installed one is used.
    pub qwen_models: Vec<String>,
    pub deepseek_models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationConfig {
    pub default_prompt: String,
    pub default_pattern: String,
}

impl Default for AutofixConfig {
    fn default() -> Self {
        Self {
            memory_dir: default_memory_dir(),
            timeouts: StageTimeouts::default(),
            claude: ClaudeConfig::default(),
            ollama: OllamaConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            analyze_secs: 120,
            apply_secs: 300,
            verify_secs: 30,
        }
    }
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_CLAUDE_MODEL.to_string(),
            max_tokens: 2000,
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            binary: "ollama".to_string(),
            qwen_models: vec![
                "qwen2.5-coder:32b".to_string(),
                "qwen2.5-coder:7b".to_string(),
                "qwen2.5-coder:latest".to_string(),
            ],
            deepseek_models: vec![
                "deepseek-coder:33b".to_string(),
                "deepseek-coder:6.7b".to_string(),
                "deepseek-coder:1.3b".to_string(),
            ],
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            default_prompt: DEFAULT_VERIFY_PROMPT.to_string(),
            default_pattern: DEFAULT_VERIFY_PATTERN.to_string(),
        }
    }
}

impl StageTimeouts {
    #[must_use]
    pub fn analyze(&self) -> Duration {
        Duration::from_secs(self.analyze_secs)
    }

    #[must_use]
    pub fn apply(&self) -> Duration {
        Duration::from_secs(self.apply_secs)
    }

    #[must_use]
    pub fn verify(&self) -> Duration {
        Duration::from_secs(self.verify_secs)
    }
}

fn default_memory_dir() -> PathBuf {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from(".autofix"), |dir| dir.join("autofix"))
        .join("memory")
}

impl AutofixConfig {
    /// Load configuration from `path` (defaults when `None`), apply environment
    /// overrides and validate.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] when the file cannot be read or parsed or the
    /// resulting values are invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigurationError::File`] when the file is unreadable or not valid YAML.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigurationError> {
        let raw = fs::read_to_string(path).map_err(|err| ConfigurationError::File {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|err| ConfigurationError::File {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    #[must_use]
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(MEMORY_DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
            self.memory_dir = PathBuf::from(dir);
        }
        self
    }

    /// # Errors
    /// Returns [`ConfigurationError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.memory_dir.as_os_str().is_empty() {
            return Err(ConfigurationError::Invalid("memory_dir MUST NOT be empty".to_string()));
        }
        for (field, secs) in [
            ("timeouts.analyze_secs", self.timeouts.analyze_secs),
            ("timeouts.apply_secs", self.timeouts.apply_secs),
            ("timeouts.verify_secs", self.timeouts.verify_secs),
        ] {
            if secs == 0 {
                return Err(ConfigurationError::Invalid(format!(
                    "{field} MUST be greater than zero"
                )));
            }
        }
        if self.claude.api_key_env.trim().is_empty() {
            return Err(ConfigurationError::Invalid(
                "claude.api_key_env MUST NOT be empty".to_string(),
            ));
        }
        if self.claude.max_tokens == 0 {
            return Err(ConfigurationError::Invalid(
                "claude.max_tokens MUST be greater than zero".to_string(),
            ));
        }
        if self.ollama.binary.trim().is_empty() {
            return Err(ConfigurationError::Invalid("ollama.binary MUST NOT be empty".to_string()));
        }
        if self.ollama.qwen_models.is_empty() || self.ollama.deepseek_models.is_empty() {
            return Err(ConfigurationError::Invalid(
                "ollama model candidate lists MUST NOT be empty".to_string(),
            ));
        }
        regex_lite::Regex::new(&self.verification.default_pattern).map_err(|err| {
            ConfigurationError::Invalid(format!("verification.default_pattern: {err}"))
        })?;
        Ok(())
    }
}
