//! Child process execution bounded by a deadline.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use crate::error::{millis, BackendError, ConfigurationError};

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    #[must_use]
    pub fn status_label(&self) -> String {
        self.status.code().map_or_else(|| "signal".to_string(), |code| format!("status {code}"))
    }
}

/// Runs child processes on a current-thread runtime owned by the backend.
///
/// Each child leads its own process group. On timeout the whole group is
/// killed, so commands that fork cannot outlive their stage.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    runtime: Arc<Runtime>,
}

impl ProcessRunner {
    /// # Errors
    /// Returns [`ConfigurationError::Runtime`] when the runtime cannot be built.
    pub fn new() -> Result<Self, ConfigurationError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ConfigurationError::Runtime(err.to_string()))?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    /// Run `command` to completion, feeding `stdin` if given.
    ///
    /// Must not be called from inside another async runtime.
    ///
    /// # Errors
    /// Returns [`BackendError::Timeout`] when the deadline passes and
    /// [`BackendError::Process`] when the child cannot be spawned or waited on.
    pub fn run(
        &self,
        command: Command,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ProcessOutput, BackendError> {
        self.runtime.block_on(run_with_timeout(command, stdin, timeout))
    }
}

async fn run_with_timeout(
    mut command: Command,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<ProcessOutput, BackendError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|err| BackendError::Process(format!("failed to spawn {program}: {err}")))?;
    let pid = child.id();

    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(input)) = (pipe, stdin) {
            // Dropping the pipe afterwards closes the child's stdin.
            let _ = pipe.write_all(input.as_bytes()).await;
        }
    };
    let run = async { tokio::join!(feed, child.wait_with_output()).1 };

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) => {
            let output = ProcessOutput {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            debug!(program = %program, status = %output.status_label(), "process finished");
            Ok(output)
        }
        Ok(Err(err)) => Err(BackendError::Process(format!("failed to wait for {program}: {err}"))),
        Err(_) => {
            warn!(
                program = %program,
                timeout_ms = millis(timeout),
                "process timed out; killing its group"
            );
            kill_group(pid).await;
            Err(BackendError::Timeout {
                after_ms: millis(timeout),
            })
        }
    }
}

/// The leader is already gone through `kill_on_drop`; this reaches the rest of its group.
#[cfg(unix)]
async fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("kill -9 -{pid} 2>/dev/null"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = status {
        warn!(pid, error = %err, "failed to kill process group");
    }
}

#[cfg(not(unix))]
async fn kill_group(_pid: Option<u32>) {}
