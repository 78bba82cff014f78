//! The execution loop: wires the Task Manager, Test Runner, and Ralph-Loop
//! together, survives crashes, and supports cooperative cancellation.

use crate::config::EngineConfig;
use crate::error::{KiroError, RalphLoopError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::ralph_loop::{self, CorrectionGenerator, ErrorContext, RuleBasedGenerator};
use crate::task_manager::TaskManager;
use crate::test_runner::{self, TestResult};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A cheaply-clonable cooperative cancellation signal, checked at every
/// suspension point named for the run loop (file I/O, the test subprocess,
/// listener delivery, the code-generation call).
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: cancelling an already-cancelled token is a no-op.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Input to the code-generation collaborator.
#[derive(Debug, Clone)]
pub struct CodeGenRequest {
    pub task_id: String,
    pub description: String,
    pub requirement_refs: Vec<String>,
    pub property_refs: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CodeGenOutcome {
    pub modified_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CodeGenError {
    pub message: String,
    pub stack: Option<String>,
}

/// Opaque code-generation operation. Expected to be deterministic given
/// identical inputs and repository state; idempotent retries are allowed.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, request: &CodeGenRequest) -> Result<CodeGenOutcome, CodeGenError>;
}

/// One audit record per Ralph-Loop attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub task_id: String,
    pub error_kind: String,
    pub target_file: String,
    pub attempt_number: u32,
    pub outcome: String,
}

/// Append-only audit interface; persistence of the log is out of scope, so
/// the default implementation is a simple in-memory sink.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

#[derive(Default)]
pub struct AuditLog {
    entries: std::sync::Mutex<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for AuditLog {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }
}

/// A point-in-time rendering of run progress, for an external CLI or
/// dashboard to display (out of scope here beyond this snapshot).
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub current_spec: Option<String>,
    pub current_task: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub completed_tasks: Vec<String>,
    pub skipped_tasks: Vec<String>,
    pub attempts: BTreeMap<String, u32>,
}

/// Result of a full run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub completed_tasks: Vec<String>,
    pub exhausted_task: Option<String>,
    pub error: Option<String>,
}

pub struct Orchestrator {
    task_manager: TaskManager,
    config: EngineConfig,
    events: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    cancellation: CancellationToken,
    generator: Option<Box<dyn CodeGenerator>>,
    correction_generator: Box<dyn CorrectionGenerator>,
    spec_dir: PathBuf,
    run_started: Option<std::time::Instant>,
}

impl Orchestrator {
    pub fn new(
        task_manager: TaskManager,
        spec_dir: PathBuf,
        config: EngineConfig,
        events: Arc<EventBus>,
        audit: Arc<dyn AuditSink>,
        cancellation: CancellationToken,
        generator: Option<Box<dyn CodeGenerator>>,
    ) -> Self {
        Self {
            task_manager,
            config,
            events,
            audit,
            cancellation,
            generator,
            correction_generator: Box::new(RuleBasedGenerator),
            spec_dir,
            run_started: None,
        }
    }

    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.task_manager.state();
        StatusSnapshot {
            current_spec: state.current_spec.clone(),
            current_task: state.current_task.clone(),
            elapsed_ms: self.run_started.map(|t| t.elapsed().as_millis() as u64),
            completed_tasks: state.completed_tasks.iter().cloned().collect(),
            skipped_tasks: state.skipped_tasks.iter().cloned().collect(),
            attempts: state.ralph_loop_attempts.clone(),
        }
    }

    /// Crash recovery: resets any task left `InProgress` on disk, then
    /// resumes the loop from selection. Attempt counters are untouched.
    pub fn recover_and_run(&mut self) -> RunOutcome {
        if let Err(e) = self.task_manager.recover_from_crash() {
            return RunOutcome {
                success: false,
                completed_tasks: vec![],
                exhausted_task: None,
                error: Some(e.to_string()),
            };
        }
        self.run()
    }

    /// Drives tasks to completion one at a time until no eligible task
    /// remains, an exhaustion halts the engine, or cancellation is
    /// observed.
    pub fn run(&mut self) -> RunOutcome {
        self.run_started = Some(std::time::Instant::now());

        loop {
            if self.cancellation.is_cancelled() {
                return self.handle_cancellation();
            }

            let Some(task_id) = self.task_manager.next_task().map(|t| t.id.clone()) else {
                break;
            };

            if let Err(e) = self.task_manager.queue(&task_id) {
                return self.halt_with_error(e);
            }
            if let Err(e) = self.task_manager.start(&task_id) {
                return self.halt_with_error(e);
            }

            if self.cancellation.is_cancelled() {
                return self.handle_cancellation();
            }

            let codegen_result = self.maybe_run_codegen(&task_id);
            if let Err(failure) = codegen_result {
                match self.handle_failure(&task_id, failure.0, failure.1) {
                    LoopDecision::Retry => continue,
                    LoopDecision::Halt(outcome) => return outcome,
                }
            }

            if self.cancellation.is_cancelled() {
                return self.handle_cancellation();
            }

            let test_result = self.maybe_run_tests(&task_id);
            match test_result {
                Ok(Some(result)) if !result.is_success() => {
                    let message = result
                        .failures
                        .first()
                        .map(|f| f.message.clone())
                        .unwrap_or_else(|| "test run failed".to_string());
                    let stack = result.failures.first().and_then(|f| f.stack.clone());
                    let failed_test = result.failures.first().map(|f| f.name.clone());
                    match self.handle_failure(&task_id, message, stack.map(|s| (s, failed_test))) {
                        LoopDecision::Retry => continue,
                        LoopDecision::Halt(outcome) => return outcome,
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let message = e.to_string();
                    match self.handle_failure(&task_id, message, None) {
                        LoopDecision::Retry => continue,
                        LoopDecision::Halt(outcome) => return outcome,
                    }
                }
            }

            if let Err(e) = self.task_manager.complete(&task_id) {
                return self.halt_with_error(e);
            }
        }

        if let Err(e) = self.task_manager.clear_execution_pointer() {
            return self.halt_with_error(e);
        }
        let completed = self
            .task_manager
            .state()
            .completed_tasks
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        self.events.emit(&OrchestratorEvent::RunCompleted {
            success: true,
            timestamp: Utc::now(),
        });
        RunOutcome {
            success: true,
            completed_tasks: completed,
            exhausted_task: None,
            error: None,
        }
    }

    /// Whether a task is treated as a code-generation task: any task that
    /// is not itself a test task (one declaring property-refs) invokes the
    /// external generator. This mirrors the spec's framing of code
    /// generation and test execution as the two possible per-task actions.
    fn is_test_task(&self, task_id: &str) -> bool {
        self.task_manager
            .spec()
            .task(task_id)
            .is_some_and(|t| !t.property_refs.is_empty())
    }

    fn maybe_run_codegen(&mut self, task_id: &str) -> Result<(), (String, Option<(String, Option<String>)>)> {
        if self.is_test_task(task_id) {
            return Ok(());
        }
        let Some(generator) = &self.generator else {
            return Ok(());
        };
        let task = match self.task_manager.spec().task(task_id) {
            Some(t) => t.clone(),
            None => return Ok(()),
        };
        let request = CodeGenRequest {
            task_id: task.id.clone(),
            description: task.description.clone(),
            requirement_refs: task.requirement_refs.clone(),
            property_refs: task.property_refs.clone(),
        };
        generator.generate(&request).map(|_| ()).map_err(|e| (e.message, e.stack.map(|s| (s, None))))
    }

    fn maybe_run_tests(&self, task_id: &str) -> Result<Option<TestResult>, KiroError> {
        if !self.is_test_task(task_id) {
            return Ok(None);
        }
        if self.config.test_command.is_empty() {
            tracing::warn!(task_id, "no test command configured, skipping test execution");
            return Ok(None);
        }
        self.events.emit(&OrchestratorEvent::TestStarted {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        });
        let result = test_runner::run_tests(
            &self.config.test_command,
            Duration::from_secs(self.config.test_timeout_secs),
            Duration::from_millis(self.config.kill_grace_ms),
        )
        .map_err(KiroError::TestRunner)?;
        self.events.emit(&OrchestratorEvent::TestCompleted {
            task_id: task_id.to_string(),
            passed: result.passed,
            failed: result.failed,
            timestamp: Utc::now(),
        });
        Ok(Some(result))
    }

    fn handle_failure(
        &mut self,
        task_id: &str,
        message: String,
        stack_and_test: Option<(String, Option<String>)>,
    ) -> LoopDecision {
        self.events.emit(&OrchestratorEvent::TaskFailed {
            task_id: task_id.to_string(),
            message: message.clone(),
            timestamp: Utc::now(),
        });

        let (stack, failed_test) = stack_and_test.unzip();
        let ctx = ErrorContext {
            task_id: task_id.to_string(),
            message,
            stack,
            failed_test: failed_test.flatten(),
            timestamp: Utc::now(),
        };

        match self.attempt_correction(&ctx) {
            Ok(true) => LoopDecision::Retry,
            Ok(false) => {
                let completed = self
                    .task_manager
                    .state()
                    .completed_tasks
                    .iter()
                    .cloned()
                    .collect();
                self.events.emit(&OrchestratorEvent::RunCompleted {
                    success: false,
                    timestamp: Utc::now(),
                });
                LoopDecision::Halt(RunOutcome {
                    success: false,
                    completed_tasks: completed,
                    exhausted_task: Some(task_id.to_string()),
                    error: Some(format!("task {task_id} exhausted its correction budget")),
                })
            }
            Err(e) => LoopDecision::Halt(self.halt_with_error(e)),
        }
    }

    /// Runs one Ralph-Loop attempt for `ctx`. Returns `Ok(true)` if a
    /// correction was applied and the task reset for retry, `Ok(false)` if
    /// the task is now exhausted.
    fn attempt_correction(&mut self, ctx: &ErrorContext) -> Result<bool, KiroError> {
        let attempt_number = self.task_manager.increment_attempts(&ctx.task_id)?;
        if attempt_number > self.config.max_attempts {
            self.events.emit(&OrchestratorEvent::CorrectionExhausted {
                task_id: ctx.task_id.clone(),
                attempt: attempt_number,
                timestamp: Utc::now(),
            });
            return Ok(false);
        }

        let kind = ralph_loop::classify(ctx);
        let target = ralph_loop::target_file(kind, self.task_manager.spec());
        let target_path = self.spec_dir.join(target);
        let before = std::fs::read_to_string(&target_path).unwrap_or_default();

        let outcome = self
            .correction_generator
            .generate(ctx, kind, &before, self.task_manager.spec())
            .and_then(|after| {
                ralph_loop::validate_correction(target, &before, &after, self.task_manager.spec())?;
                let backups_dir = self.config.backups_dir();
                ralph_loop::apply_correction(
                    &self.spec_dir,
                    target,
                    &after,
                    Some(backups_dir.as_path()),
                    Some(self.config.backup_keep),
                )
                .map_err(|_| RalphLoopError::EmptyCorrection { file: target.to_string() })?;
                Ok(())
            });

        let audit_outcome = match &outcome {
            Ok(()) => "applied",
            Err(_) => "rejected",
        };
        self.audit.record(AuditEntry {
            timestamp: ctx.timestamp,
            task_id: ctx.task_id.clone(),
            error_kind: kind.as_str().to_string(),
            target_file: target.to_string(),
            attempt_number,
            outcome: audit_outcome.to_string(),
        });

        if outcome.is_ok() {
            self.events.emit(&OrchestratorEvent::CorrectionApplied {
                task_id: ctx.task_id.clone(),
                target_file: target.to_string(),
                attempt: attempt_number,
                timestamp: Utc::now(),
            });
            self.task_manager.reset(&ctx.task_id)?;
        }

        Ok(true)
    }

    fn halt_with_error(&self, error: KiroError) -> RunOutcome {
        let completed = self
            .task_manager
            .state()
            .completed_tasks
            .iter()
            .cloned()
            .collect();
        RunOutcome {
            success: false,
            completed_tasks: completed,
            exhausted_task: None,
            error: Some(error.to_string()),
        }
    }

    /// Cancellation: terminate gracefully, flush state, reset the current
    /// task, emit a terminal event, and return. Idempotent because
    /// `CancellationToken::cancel` is idempotent and this is only reached
    /// via `is_cancelled()` checks.
    fn handle_cancellation(&mut self) -> RunOutcome {
        if let Some(task_id) = self.task_manager.state().current_task.clone() {
            let _ = self.task_manager.reset(&task_id);
        }
        let _ = self.task_manager.clear_execution_pointer();
        self.events.emit(&OrchestratorEvent::RunCancelled {
            timestamp: Utc::now(),
        });
        RunOutcome {
            success: false,
            completed_tasks: vec![],
            exhausted_task: None,
            error: None,
        }
    }
}

enum LoopDecision {
    Retry,
    Halt(RunOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::fs;
    use tempfile::TempDir;

    struct AlwaysSucceeds;
    impl CodeGenerator for AlwaysSucceeds {
        fn generate(&self, _request: &CodeGenRequest) -> Result<CodeGenOutcome, CodeGenError> {
            Ok(CodeGenOutcome::default())
        }
    }

    fn setup(tasks_md: &str) -> (TempDir, Orchestrator) {
        let dir = TempDir::new().unwrap();
        let spec_dir = dir.path().join("spec");
        fs::create_dir_all(&spec_dir).unwrap();
        fs::write(
            spec_dir.join("requirements.md"),
            "### Requirement 1\n\n**User Story:** As a user, I want X.\n\n#### Acceptance Criteria\n\n1. It works\n",
        )
        .unwrap();
        fs::write(spec_dir.join("design.md"), "### Property 1: Works\n\nIt works.\n").unwrap();
        fs::write(spec_dir.join("tasks.md"), tasks_md).unwrap();

        let mut config = EngineConfig::default();
        config.workdir = Some(dir.path().to_path_buf());
        let events = Arc::new(EventBus::new());
        let manager = TaskManager::load(&spec_dir, "demo", config.clone(), events.clone()).unwrap();

        let orchestrator = Orchestrator::new(
            manager,
            spec_dir,
            config,
            events,
            Arc::new(AuditLog::new()),
            CancellationToken::new(),
            Some(Box::new(AlwaysSucceeds)),
        );
        (dir, orchestrator)
    }

    #[test]
    fn s1_full_run_completes_all_tasks() {
        let (_dir, mut orchestrator) =
            setup("- [ ] 1 Root\n  - [ ] 1.1 Child\n  - [ ] 1.2 Child2\n- [ ] 2 Sibling\n");
        let outcome = orchestrator.run();
        assert!(outcome.success);
        assert_eq!(outcome.completed_tasks.len(), 4);
        assert!(orchestrator.task_manager().state().current_task.is_none());
    }

    #[test]
    fn cancellation_reaches_quiescent_state() {
        let (_dir, mut orchestrator) =
            setup("- [ ] 1 Root\n- [ ] 2 Sibling\n");
        orchestrator.cancellation.cancel();
        let outcome = orchestrator.run();
        assert!(!outcome.success);
        assert!(orchestrator.task_manager().state().current_task.is_none());
        assert_eq!(orchestrator.task_manager().in_progress_count(), 0);
    }

    #[test]
    fn status_snapshot_reflects_progress() {
        let (_dir, mut orchestrator) = setup("- [ ] 1 Root\n");
        orchestrator.run();
        let status = orchestrator.status();
        assert_eq!(status.completed_tasks, vec!["1".to_string()]);
        assert!(status.current_task.is_none());
    }
}
