//! Name-keyed catalogue of the built-in fixer backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::backends::{ClaudeBackend, FixerBackend, OllamaBackend, OllamaCli};
use crate::config::AutofixConfig;
use crate::error::ConfigurationError;
use crate::process::ProcessRunner;

const INSTALL_OLLAMA_HELP: &str = "Install Ollama: curl -fsSL https://ollama.ai/install.sh | sh";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cloud,
    Local,
}

/// Static description of a backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub kind: BackendKind,
    pub provider: &'static str,
    pub description: &'static str,
    pub requirements: String,
}

/// Whether a backend can be constructed right now, with steps to fix it if not.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    pub setup_help: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    #[serde(flatten)]
    pub info: BackendInfo,
    #[serde(flatten)]
    pub availability: Availability,
}

type Factory = fn(&AutofixConfig) -> Result<Arc<dyn FixerBackend>, ConfigurationError>;
type Probe = fn(&AutofixConfig) -> Availability;

struct Entry {
    info: fn(&AutofixConfig) -> BackendInfo,
    factory: Factory,
    probe: Probe,
}

/// Maps backend names to their constructors. Unknown names are rejected before
/// any attempt starts.
pub struct BackendRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin_backends()
    }
}

impl BackendRegistry {
    #[must_use]
    pub fn with_builtin_backends() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "claude",
            Entry {
                info: claude_info,
                factory: build_claude,
                probe: probe_claude,
            },
        );
        entries.insert(
            "qwen",
            Entry {
                info: qwen_info,
                factory: build_qwen,
                probe: probe_qwen,
            },
        );
        entries.insert(
            "deepseek",
            Entry {
                info: deepseek_info,
                factory: build_deepseek,
                probe: probe_deepseek,
            },
        );
        Self { entries }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    fn entry(&self, name: &str) -> Result<&Entry, ConfigurationError> {
        self.entries.get(name).ok_or_else(|| ConfigurationError::UnknownBackend {
            name: name.to_string(),
            known: self.names().collect::<Vec<_>>().join(", "),
        })
    }

    /// # Errors
    /// Returns [`ConfigurationError::UnknownBackend`] for an unregistered name.
    pub fn describe(
        &self,
        name: &str,
        config: &AutofixConfig,
    ) -> Result<BackendInfo, ConfigurationError> {
        Ok((self.entry(name)?.info)(config))
    }

    /// Construct the named backend.
    ///
    /// # Errors
    /// Returns [`ConfigurationError`] for an unknown name, a missing credential or
    /// a backend whose local prerequisites are not installed.
    pub fn create(
        &self,
        name: &str,
        config: &AutofixConfig,
    ) -> Result<Arc<dyn FixerBackend>, ConfigurationError> {
        (self.entry(name)?.factory)(config)
    }

    /// Describe every backend along with its current availability.
    #[must_use]
    pub fn list(&self, config: &AutofixConfig) -> Vec<BackendStatus> {
        self.entries
            .values()
            .map(|entry| BackendStatus {
                info: (entry.info)(config),
                availability: (entry.probe)(config),
            })
            .collect()
    }
}

fn claude_info(config: &AutofixConfig) -> BackendInfo {
    BackendInfo {
        name: "claude",
        display_name: "Claude 3.5 Sonnet",
        kind: BackendKind::Cloud,
        provider: "Anthropic",
        description: "Hosted assistant with strong reasoning, reached over the Messages API",
        requirements: format!("{} environment variable", config.claude.api_key_env),
    }
}

fn qwen_info(config: &AutofixConfig) -> BackendInfo {
    BackendInfo {
        name: "qwen",
        display_name: "Qwen 2.5 Coder",
        kind: BackendKind::Local,
        provider: "Alibaba",
        description: "Local coding-specialized model served by Ollama",
        requirements: format!(
            "one of [{}] installed in Ollama",
            config.ollama.qwen_models.join(", ")
        ),
    }
}

fn deepseek_info(config: &AutofixConfig) -> BackendInfo {
    BackendInfo {
        name: "deepseek",
        display_name: "DeepSeek Coder",
        kind: BackendKind::Local,
        provider: "DeepSeek",
        description: "Local code-specialized model with strong debugging skills, served by Ollama",
        requirements: format!(
            "one of [{}] installed in Ollama",
            config.ollama.deepseek_models.join(", ")
        ),
    }
}

fn build_claude(config: &AutofixConfig) -> Result<Arc<dyn FixerBackend>, ConfigurationError> {
    let backend = ClaudeBackend::from_config(config, |name| std::env::var(name).ok())?;
    Ok(Arc::new(backend))
}

fn build_qwen(config: &AutofixConfig) -> Result<Arc<dyn FixerBackend>, ConfigurationError> {
    build_local("qwen", config, &config.ollama.qwen_models)
}

fn build_deepseek(config: &AutofixConfig) -> Result<Arc<dyn FixerBackend>, ConfigurationError> {
    build_local("deepseek", config, &config.ollama.deepseek_models)
}

fn build_local(
    name: &str,
    config: &AutofixConfig,
    candidates: &[String],
) -> Result<Arc<dyn FixerBackend>, ConfigurationError> {
    let cli = OllamaCli::new(config.ollama.binary.clone(), ProcessRunner::new()?);
    let backend =
        OllamaBackend::select(name, cli, candidates, config.timeouts, config.verification.clone())?;
    Ok(Arc::new(backend))
}

fn probe_claude(config: &AutofixConfig) -> Availability {
    let has_key =
        std::env::var(&config.claude.api_key_env).is_ok_and(|key| !key.trim().is_empty());
    let setup_help = if has_key {
        Vec::new()
    } else {
        vec![
            format!("Set {} to an Anthropic API key", config.claude.api_key_env),
            "Get an API key: https://console.anthropic.com/".to_string(),
        ]
    };
    Availability {
        available: has_key,
        setup_help,
    }
}

fn probe_qwen(config: &AutofixConfig) -> Availability {
    probe_local(config, &config.ollama.qwen_models)
}

fn probe_deepseek(config: &AutofixConfig) -> Availability {
    probe_local(config, &config.ollama.deepseek_models)
}

fn probe_local(config: &AutofixConfig, candidates: &[String]) -> Availability {
    let runner = match ProcessRunner::new() {
        Ok(runner) => runner,
        Err(err) => {
            return Availability {
                available: false,
                setup_help: vec![err.to_string()],
            }
        }
    };
    let cli = OllamaCli::new(config.ollama.binary.clone(), runner);
    if !cli.is_installed() {
        return Availability {
            available: false,
            setup_help: vec![INSTALL_OLLAMA_HELP.to_string()],
        };
    }
    if cli.first_installed(candidates).is_some() {
        return Availability {
            available: true,
            setup_help: Vec::new(),
        };
    }
    let suggestion = candidates.last().map_or("<model>", String::as_str);
    Availability {
        available: false,
        setup_help: vec![format!("Install model: {} pull {suggestion}", cli.binary())],
    }
}
