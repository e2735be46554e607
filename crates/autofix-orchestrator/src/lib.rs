//! Fixer backends, their registry, and the attempt orchestrator.

pub mod backends;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod prompt;
pub mod registry;

pub use backends::{FixerBackend, Verification};
pub use config::{AutofixConfig, StageTimeouts, MEMORY_DIR_ENV};
pub use error::{BackendError, ConfigurationError, OrchestratorError};
pub use orchestrator::{AttemptReport, Orchestrator};
pub use process::ProcessRunner;
pub use registry::{Availability, BackendInfo, BackendKind, BackendRegistry, BackendStatus};
