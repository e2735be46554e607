//! One analyze/apply/verify attempt, recorded exactly once.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use autofix_core::{
    AttemptOutcome, AttemptState, AttemptTrace, FixDescriptor, Issue, StageFailure,
};
use autofix_store_sqlite::MemoryStore;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backends::{FixerBackend, Verification};
use crate::config::StageTimeouts;
use crate::error::{millis, BackendError, ConfigurationError, OrchestratorError};

const VERIFIED_NOTE: &str = "fix applied and verified";

/// Extra wait past a stage deadline so a backend can finish killing its own
/// children before the attempt is recorded.
const BACKEND_GRACE: Duration = Duration::from_secs(2);

/// What happened during one attempt, as persisted and as reported to callers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptReport {
    pub attempt_id: i64,
    pub backend: String,
    pub state: AttemptState,
    pub history: Vec<AttemptState>,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_response: Option<String>,
    pub duration_seconds: f64,
    pub notes: String,
}

impl AttemptReport {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.outcome.verified
    }
}

/// Drives a single backend through the attempt state machine and records each
/// terminal state in the memory store.
pub struct Orchestrator {
    store: MemoryStore,
    backend: Arc<dyn FixerBackend>,
    timeouts: StageTimeouts,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: MemoryStore,
        backend: Arc<dyn FixerBackend>,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            store,
            backend,
            timeouts,
        }
    }

    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> MemoryStore {
        self.store
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Run one attempt for `issue`. No retries are made.
    ///
    /// Stage failures end the attempt and are reported in the returned
    /// [`AttemptReport`]; they are not errors.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Configuration`] for an invalid issue, before
    /// anything runs, and [`OrchestratorError::Persistence`] when the attempt
    /// cannot be recorded.
    pub fn run(&mut self, issue: &Issue) -> Result<AttemptReport, OrchestratorError> {
        issue
            .validate()
            .map_err(|err| ConfigurationError::InvalidIssue(err.to_string()))?;

        let backend_name = self.backend.name().to_string();
        let started = Instant::now();
        let mut trace = AttemptTrace::new();
        info!(
            backend = %backend_name,
            model = %issue.model,
            issue_type = %issue.issue_type,
            signature = %issue.signature(),
            "starting fix attempt"
        );

        if let Err(err) = self.store.refresh_knowledge_base() {
            warn!(error = %err, "knowledge base reload failed; using cached copy");
        }

        let (fix, failure, verification_response) = self.walk(issue, &mut trace);

        let state = trace.state();
        let outcome = state.outcome().unwrap_or(AttemptOutcome::NOT_APPLIED);
        let notes = failure
            .as_ref()
            .map_or_else(|| VERIFIED_NOTE.to_string(), ToString::to_string);
        let duration_seconds = started.elapsed().as_secs_f64();

        let attempt_id = self
            .store
            .record_fix_attempt(
                issue,
                fix.as_ref().unwrap_or(&FixDescriptor::default()),
                outcome,
                duration_seconds,
                Some(&notes),
                &backend_name,
            )
            .map_err(OrchestratorError::Persistence)?;

        info!(
            attempt_id,
            backend = %backend_name,
            state = %state,
            fix_applied = outcome.fix_applied,
            verified = outcome.verified,
            duration_seconds,
            "fix attempt finished"
        );

        Ok(AttemptReport {
            attempt_id,
            backend: backend_name,
            state,
            history: trace.history().to_vec(),
            outcome,
            failure,
            fix,
            verification_response,
            duration_seconds,
            notes,
        })
    }

    fn walk(
        &self,
        issue: &Issue,
        trace: &mut AttemptTrace,
    ) -> (Option<FixDescriptor>, Option<StageFailure>, Option<String>) {
        enter(trace, AttemptState::Analyzing);
        let context = self.store.build_context(issue);
        debug!(context_chars = context.len(), "historical context built");

        let fix = match self.analyze(issue, context) {
            Ok(fix) => fix,
            Err(failure) => return (None, Some(fail(trace, failure)), None),
        };
        enter(trace, AttemptState::Analyzed);
        info!(
            commands = fix.commands().len(),
            confidence = ?fix.confidence,
            "analysis produced a fix descriptor"
        );

        enter(trace, AttemptState::Applying);
        if let Err(failure) = self.apply(&fix) {
            return (Some(fix), Some(fail(trace, failure)), None);
        }
        enter(trace, AttemptState::Applied);

        enter(trace, AttemptState::Verifying);
        match self.verify(issue, &fix) {
            Ok(response) => {
                enter(trace, AttemptState::Verified);
                (Some(fix), None, Some(response))
            }
            Err((failure, response)) => (Some(fix), Some(fail(trace, failure)), response),
        }
    }

    fn analyze(&self, issue: &Issue, context: String) -> Result<FixDescriptor, StageFailure> {
        let timeout = self.timeouts.analyze();
        let owned_issue = issue.clone();
        let result = call_with_deadline(&self.backend, timeout, move |backend| {
            backend.analyze(&owned_issue, &context)
        });

        match result {
            Ok(fix) if fix.analysis.trim().is_empty() => Err(StageFailure::MalformedDescriptor {
                reason: "fix descriptor has no analysis".to_string(),
            }),
            Ok(fix) => Ok(fix),
            Err(BackendError::Timeout { .. }) => Err(StageFailure::AnalysisTimeout {
                after_ms: millis(timeout),
            }),
            Err(BackendError::Malformed(reason)) => {
                Err(StageFailure::MalformedDescriptor { reason })
            }
            Err(err) => Err(StageFailure::AnalysisFailed {
                reason: err.to_string(),
            }),
        }
    }

    fn apply(&self, fix: &FixDescriptor) -> Result<(), StageFailure> {
        let timeout = self.timeouts.apply();
        let owned_fix = fix.clone();
        let result =
            call_with_deadline(&self.backend, timeout, move |backend| backend.apply(&owned_fix));
        match result {
            Ok(()) => Ok(()),
            Err(BackendError::Timeout { .. }) => Err(StageFailure::ApplyTimeout {
                after_ms: millis(timeout),
            }),
            Err(err) => Err(StageFailure::ApplyFailed {
                reason: err.to_string(),
            }),
        }
    }

    /// Verified response on success; the failure and any response seen otherwise.
    fn verify(
        &self,
        issue: &Issue,
        fix: &FixDescriptor,
    ) -> Result<String, (StageFailure, Option<String>)> {
        let timeout = self.timeouts.verify();
        let owned_issue = issue.clone();
        let owned_fix = fix.clone();
        let result = call_with_deadline(&self.backend, timeout, move |backend| {
            backend.verify(&owned_issue, &owned_fix)
        });

        match result {
            Ok(Verification::Verified { response }) => Ok(response),
            Ok(Verification::Mismatch { response }) => Err((
                StageFailure::VerificationMismatch {
                    reason: format!("response `{response}` does not match the expected pattern"),
                },
                Some(response),
            )),
            Err(BackendError::Timeout { .. }) => Err((
                StageFailure::VerificationTimeout {
                    after_ms: millis(timeout),
                },
                None,
            )),
            Err(err) => Err((
                StageFailure::VerificationFailed {
                    reason: err.to_string(),
                },
                None,
            )),
        }
    }
}

fn enter(trace: &mut AttemptTrace, next: AttemptState) {
    let result = trace.advance(next);
    match &result {
        Ok(()) => debug!(attempt.state = %next, "attempt state changed"),
        Err(err) => error!(error = %err, "attempt state machine rejected a transition"),
    }
    debug_assert!(result.is_ok(), "attempt state machine rejected {next}");
}

fn fail(trace: &mut AttemptTrace, failure: StageFailure) -> StageFailure {
    if failure.is_timeout() {
        warn!(failure = %failure, "backend call timed out");
    } else {
        warn!(failure = %failure, "attempt stage failed");
    }
    enter(trace, failure.terminal_state());
    failure
}

/// Run `call` on a worker thread and stop waiting shortly after `timeout`.
///
/// Backends bound their own child processes by the same deadline, so the grace
/// period only matters for calls that ignore it. Such a call keeps running
/// detached and its result is dropped.
fn call_with_deadline<T, F>(
    backend: &Arc<dyn FixerBackend>,
    timeout: Duration,
    call: F,
) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce(&dyn FixerBackend) -> Result<T, BackendError> + Send + 'static,
{
    let backend = Arc::clone(backend);
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("autofix-backend-call".to_string())
        .spawn(move || {
            let _ = tx.send(call(backend.as_ref()));
        })
        .map_err(|err| BackendError::Process(format!("failed to start backend call: {err}")))?;

    match rx.recv_timeout(timeout + BACKEND_GRACE) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(BackendError::Timeout {
            after_ms: millis(timeout),
        }),
        Err(RecvTimeoutError::Disconnected) => {
            Err(BackendError::Process("backend call ended without a result".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use autofix_core::CONTEXT_HEADER;

    use super::*;

    struct ScriptedBackend {
        analysis: Result<FixDescriptor, BackendError>,
        analyze_delay: Duration,
        application: Result<(), BackendError>,
        verification: Result<Verification, BackendError>,
        analyze_calls: AtomicUsize,
        apply_calls: AtomicUsize,
        verify_calls: AtomicUsize,
        contexts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn succeeding() -> Self {
            Self {
                analysis: Ok(sample_fix()),
                analyze_delay: Duration::ZERO,
                application: Ok(()),
                verification: Ok(Verification::Verified {
                    response: "4".to_string(),
                }),
                analyze_calls: AtomicUsize::new(0),
                apply_calls: AtomicUsize::new(0),
                verify_calls: AtomicUsize::new(0),
                contexts: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> (usize, usize, usize) {
            (
                self.analyze_calls.load(Ordering::SeqCst),
                self.apply_calls.load(Ordering::SeqCst),
                self.verify_calls.load(Ordering::SeqCst),
            )
        }
    }

    impl FixerBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn analyze(&self, _issue: &Issue, context: &str) -> Result<FixDescriptor, BackendError> {
            self.analyze_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut contexts) = self.contexts.lock() {
                contexts.push(context.to_string());
            }
            thread::sleep(self.analyze_delay);
            self.analysis.clone()
        }

        fn apply(&self, _fix: &FixDescriptor) -> Result<(), BackendError> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            self.application.clone()
        }

        fn verify(
            &self,
            _issue: &Issue,
            _fix: &FixDescriptor,
        ) -> Result<Verification, BackendError> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            self.verification.clone()
        }
    }

    fn sample_fix() -> FixDescriptor {
        FixDescriptor {
            analysis: "model unloaded between requests".to_string(),
            fix_commands: Some(vec!["ollama pull llama3:8b".to_string()]),
            confidence: Some(0.8),
            ..FixDescriptor::default()
        }
    }

    fn sample_issue() -> Issue {
        let mut issue = Issue::new("llama3:8b", "timeout");
        issue.description = "no answer within 30s".to_string();
        issue.test_prompt = Some("2+2?".to_string());
        issue.expected_pattern = Some(".*4.*".to_string());
        issue
    }

    fn orchestrator(
        dir: &tempfile::TempDir,
        backend: &Arc<ScriptedBackend>,
        timeouts: StageTimeouts,
    ) -> Result<Orchestrator> {
        let store = MemoryStore::open(dir.path())?;
        let backend: Arc<dyn FixerBackend> = Arc::clone(backend) as Arc<dyn FixerBackend>;
        Ok(Orchestrator::new(store, backend, timeouts))
    }

    #[test]
    fn verified_attempt_walks_every_state_and_records_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend::succeeding());
        let mut orchestrator = orchestrator(&dir, &backend, StageTimeouts::default())?;

        let report = orchestrator.run(&sample_issue())?;

        assert_eq!(report.state, AttemptState::Verified);
        assert_eq!(report.history.len(), 7);
        assert!(report.is_verified());
        assert_eq!(report.notes, VERIFIED_NOTE);
        assert_eq!(report.verification_response.as_deref(), Some("4"));
        assert_eq!(backend.calls(), (1, 1, 1));

        let attempts = orchestrator.store().list_attempts()?;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].id, report.attempt_id);
        assert_eq!(attempts[0].backend, "scripted");
        assert!(attempts[0].fix_applied && attempts[0].verified);
        assert_eq!(attempts[0].commands, vec!["ollama pull llama3:8b".to_string()]);
        Ok(())
    }

    #[test]
    fn analysis_failure_records_once_and_never_applies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend {
            analysis: Err(BackendError::Http("HTTP 500: overloaded".to_string())),
            ..ScriptedBackend::succeeding()
        });
        let mut orchestrator = orchestrator(&dir, &backend, StageTimeouts::default())?;

        let report = orchestrator.run(&sample_issue())?;

        assert_eq!(report.state, AttemptState::AnalysisFailed);
        assert!(matches!(report.failure, Some(StageFailure::AnalysisFailed { .. })));
        assert_eq!(report.fix, None);
        assert_eq!(backend.calls(), (1, 0, 0));

        let attempts = orchestrator.store().list_attempts()?;
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].fix_applied);
        assert!(!attempts[0].verified);
        assert!(attempts[0].notes.as_deref().is_some_and(|notes| notes.contains("HTTP 500")));
        Ok(())
    }

    #[test]
    fn descriptor_without_analysis_is_malformed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend {
            analysis: Ok(FixDescriptor::default()),
            ..ScriptedBackend::succeeding()
        });
        let mut orchestrator = orchestrator(&dir, &backend, StageTimeouts::default())?;

        let report = orchestrator.run(&sample_issue())?;

        assert!(matches!(report.failure, Some(StageFailure::MalformedDescriptor { .. })));
        assert_eq!(report.state, AttemptState::AnalysisFailed);
        assert_eq!(backend.calls(), (1, 0, 0));
        Ok(())
    }

    #[test]
    fn slow_analysis_times_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend {
            analyze_delay: Duration::from_secs(10),
            ..ScriptedBackend::succeeding()
        });
        let timeouts = StageTimeouts {
            analyze_secs: 1,
            ..StageTimeouts::default()
        };
        let mut orchestrator = orchestrator(&dir, &backend, timeouts)?;

        let report = orchestrator.run(&sample_issue())?;

        assert_eq!(
            report.failure,
            Some(StageFailure::AnalysisTimeout { after_ms: 1000 })
        );
        assert!(report.duration_seconds < 8.0);
        assert_eq!(orchestrator.store().list_attempts()?.len(), 1);
        assert_eq!(backend.calls().1, 0);
        Ok(())
    }

    #[test]
    fn apply_failure_skips_verification() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend {
            application: Err(BackendError::CommandFailed {
                command: "ollama pull llama3:8b".to_string(),
                status: "status 1".to_string(),
                stderr: "pull failed".to_string(),
            }),
            ..ScriptedBackend::succeeding()
        });
        let mut orchestrator = orchestrator(&dir, &backend, StageTimeouts::default())?;

        let report = orchestrator.run(&sample_issue())?;

        assert_eq!(report.state, AttemptState::ApplyFailed);
        assert_eq!(report.outcome, AttemptOutcome::NOT_APPLIED);
        assert_eq!(backend.calls(), (1, 1, 0));
        let attempts = orchestrator.store().list_attempts()?;
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].fix_applied);
        assert_eq!(attempts[0].analysis, "model unloaded between requests");
        Ok(())
    }

    #[test]
    fn verification_timeout_and_mismatch_record_alike_with_distinct_notes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mismatch = Arc::new(ScriptedBackend {
            verification: Ok(Verification::Mismatch {
                response: "5".to_string(),
            }),
            ..ScriptedBackend::succeeding()
        });
        let timeout = Arc::new(ScriptedBackend {
            verification: Err(BackendError::Timeout { after_ms: 30_000 }),
            ..ScriptedBackend::succeeding()
        });

        let first =
            orchestrator(&dir, &mismatch, StageTimeouts::default())?.run(&sample_issue())?;
        let second =
            orchestrator(&dir, &timeout, StageTimeouts::default())?.run(&sample_issue())?;

        assert_eq!(first.outcome, AttemptOutcome::APPLIED_UNVERIFIED);
        assert_eq!(second.outcome, AttemptOutcome::APPLIED_UNVERIFIED);
        assert_eq!(first.state, second.state);
        assert!(matches!(first.failure, Some(StageFailure::VerificationMismatch { .. })));
        assert!(matches!(second.failure, Some(StageFailure::VerificationTimeout { .. })));
        assert_ne!(first.notes, second.notes);
        assert_eq!(first.verification_response.as_deref(), Some("5"));

        let store = MemoryStore::open(dir.path())?;
        let attempts = store.list_attempts()?;
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|attempt| attempt.fix_applied && !attempt.verified));
        Ok(())
    }

    #[test]
    fn later_attempts_see_earlier_history_in_context() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend::succeeding());
        let mut orchestrator = orchestrator(&dir, &backend, StageTimeouts::default())?;

        orchestrator.run(&sample_issue())?;
        orchestrator.run(&sample_issue())?;

        let contexts = backend.contexts.lock().map_err(|_| anyhow!("context log poisoned"))?;
        assert_eq!(contexts.len(), 2);
        assert!(contexts.iter().all(|context| context.starts_with(CONTEXT_HEADER)));
        assert!(!contexts[0].contains("model unloaded between requests"));
        assert!(contexts[1].contains("model unloaded between requests"));
        Ok(())
    }

    #[test]
    fn invalid_issue_is_rejected_before_any_call() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend::succeeding());
        let mut orchestrator = orchestrator(&dir, &backend, StageTimeouts::default())?;

        let result = orchestrator.run(&Issue::new("", "timeout"));

        assert!(matches!(
            result,
            Err(OrchestratorError::Configuration(ConfigurationError::InvalidIssue(_)))
        ));
        assert_eq!(backend.calls(), (0, 0, 0));
        assert!(orchestrator.store().list_attempts()?.is_empty());
        Ok(())
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "attempt state machine rejected verified")]
    fn skipped_transition_panics_in_debug_builds() {
        let mut trace = AttemptTrace::new();
        enter(&mut trace, AttemptState::Verified);
    }

    #[cfg(unix)]
    #[test]
    fn reply_without_commands_key_fails_apply_and_skips_verification() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        use crate::backends::{OllamaBackend, OllamaCli};
        use crate::config::VerificationConfig;
        use crate::process::ProcessRunner;

        let dir = tempfile::tempdir()?;
        let script = dir.path().join("ollama");
        let verified_marker = dir.path().join("verified");
        std::fs::write(
            &script,
            format!(
                concat!(
                    "#!/bin/sh\n",
                    "cat > /dev/null\n",
                    "if [ \"$2\" = \"qwen2.5-coder:7b\" ]; then\n",
                    "  echo '{{\"analysis\": \"restart it\"}}'\n",
                    "else\n",
                    "  touch {marker}\n",
                    "  echo 'The answer is 4.'\n",
                    "fi\n",
                ),
                marker = verified_marker.display(),
            ),
        )?;
        let mut permissions = std::fs::metadata(&script)?.permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&script, permissions)?;

        let cli = OllamaCli::new(script.display().to_string(), ProcessRunner::new()?);
        let backend: Arc<dyn FixerBackend> = Arc::new(OllamaBackend::with_model(
            "qwen",
            "qwen2.5-coder:7b",
            cli,
            StageTimeouts::default(),
            VerificationConfig::default(),
        ));
        let store = MemoryStore::open(&dir.path().join("memory"))?;
        let mut orchestrator = Orchestrator::new(store, backend, StageTimeouts::default());

        let report = orchestrator.run(&sample_issue())?;

        assert_eq!(report.state, AttemptState::ApplyFailed);
        assert_eq!(report.outcome, AttemptOutcome::NOT_APPLIED);
        assert!(matches!(
            report.failure,
            Some(StageFailure::ApplyFailed { ref reason }) if reason.contains("no fix_commands")
        ));
        assert!(!verified_marker.exists());

        let attempts = orchestrator.store().list_attempts()?;
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].fix_applied);
        assert!(!attempts[0].verified);
        Ok(())
    }
}
