//! Task state machine, persistence, and ordered selection.
//!
//! Owns the parsed spec and the persisted `OrchestratorState`, the same
//! role the teacher's `TaskStore` plays for its own JSONL-backed task list:
//! a single in-memory authority that every mutation flows through, with
//! every mutation immediately durable via the atomic file substrate.

use crate::atomic;
use crate::config::EngineConfig;
use crate::error::{AtomicFileError, KiroError, ParseError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::model::{OrchestratorState, ParsedSpec, Task, TaskStatus};
use crate::parser;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

pub struct TaskManager {
    spec: ParsedSpec,
    state: OrchestratorState,
    config: EngineConfig,
    tasks_path: PathBuf,
    state_path: PathBuf,
    events: Arc<EventBus>,
}

impl TaskManager {
    /// Loads a feature's spec directory and validates cross-references.
    /// Task statuses come from `tasks.md` itself (the source of truth); the
    /// persisted `OrchestratorState` (attempt counters, completed/skipped
    /// sets, current task pointer) is reused as-is when it already belongs
    /// to this feature, so a restart after a crash or an exhaustion halt
    /// does not reset attempt counters — only `recover_from_crash` resets an
    /// `in_progress` task. A state file belonging to a different feature, or
    /// missing/corrupt, starts fresh.
    pub fn load(
        spec_dir: &std::path::Path,
        feature_name: &str,
        config: EngineConfig,
        events: Arc<EventBus>,
    ) -> Result<Self, KiroError> {
        let spec = parser::parse_spec_dir(spec_dir, feature_name)?;
        let tasks_path = spec_dir.join("tasks.md");
        let state_path = config.state_path();

        let persisted = Self::load_persisted_state(&state_path);
        let state = if persisted.current_spec.as_deref() == Some(feature_name) {
            persisted
        } else {
            OrchestratorState {
                current_spec: Some(feature_name.to_string()),
                ..Default::default()
            }
        };

        let mut manager = Self {
            spec,
            state,
            config,
            tasks_path,
            state_path,
            events,
        };
        manager.persist_state()?;
        Ok(manager)
    }

    /// Loads persisted state from disk if present and well-formed; falls
    /// back to a fresh state (with a warning) if missing or corrupt, per
    /// the spec's "never crash on a corrupt state file" rule.
    pub fn load_persisted_state(state_path: &std::path::Path) -> OrchestratorState {
        match std::fs::read_to_string(state_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %state_path.display(), "corrupt orchestrator state, falling back to fresh state");
                OrchestratorState::default()
            }),
            Err(_) => OrchestratorState::default(),
        }
    }

    pub fn spec(&self) -> &ParsedSpec {
        &self.spec
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    fn persist_state(&self) -> Result<(), AtomicFileError> {
        let json = serde_json::to_vec_pretty(&self.state).expect("state is always serializable");
        atomic::atomic_write(
            &self.state_path,
            &json,
            None,
            atomic::CreatePolicy::CreateParents,
        )
    }

    fn task(&self, id: &str) -> Result<&Task, KiroError> {
        self.spec
            .task(id)
            .ok_or_else(|| KiroError::Internal(format!("no such task: {id}")))
    }

    fn is_exhausted(&self, id: &str) -> bool {
        self.state.attempts_for(id) >= self.config.max_attempts
    }

    /// Before any execution, verifies every task's requirement-refs and
    /// property-refs resolve. Returns the list of violations.
    pub fn validate_dependencies(&self) -> Vec<ParseError> {
        let mut violations = Vec::new();
        for task in &self.spec.tasks {
            for req_ref in &task.requirement_refs {
                if self.spec.requirement(req_ref).is_none() {
                    violations.push(ParseError::UnresolvedReference {
                        file: "tasks.md".to_string(),
                        task_id: task.id.clone(),
                        reference: req_ref.clone(),
                    });
                }
            }
            for prop_ref in &task.property_refs {
                let resolved = prop_ref
                    .parse::<u32>()
                    .ok()
                    .is_some_and(|n| self.spec.property(n).is_some());
                if !resolved {
                    violations.push(ParseError::UnresolvedReference {
                        file: "tasks.md".to_string(),
                        task_id: task.id.clone(),
                        reference: prop_ref.clone(),
                    });
                }
            }
        }
        violations
    }

    /// Returns the first task in document order that is eligible to run:
    /// `NotStarted`, not optional, not nested under a parent whose earlier
    /// non-optional siblings are incomplete, and — since sub-tasks must be
    /// executed before their parent becomes eligible for completion — not
    /// itself a parent with an incomplete non-optional child. This descends
    /// depth-first: a parent is skipped in favor of its children until they
    /// are all done, at which point the parent is selected like any other
    /// task.
    pub fn next_task(&self) -> Option<&Task> {
        self.spec.tasks.iter().find(|task| {
            task.status == TaskStatus::NotStarted
                && !task.optional
                && self.prerequisites_satisfied(task)
                && self.children_satisfied(task)
        })
    }

    fn prerequisites_satisfied(&self, task: &Task) -> bool {
        let Some(parent_id) = &task.parent else {
            return true;
        };
        let Some(parent) = self.spec.task(parent_id) else {
            return true;
        };
        for sibling_id in &parent.children {
            if sibling_id == &task.id {
                break;
            }
            if let Some(sibling) = self.spec.task(sibling_id) {
                if !sibling.optional && sibling.status != TaskStatus::Completed {
                    return false;
                }
            }
        }
        true
    }

    fn children_satisfied(&self, task: &Task) -> bool {
        task.children.iter().all(|child_id| match self.spec.task(child_id) {
            Some(child) => child.optional || child.status == TaskStatus::Completed,
            None => true,
        })
    }

    fn transition(&mut self, id: &str, next: TaskStatus) -> Result<(), KiroError> {
        if self.is_exhausted(id) {
            return Err(KiroError::Exhausted {
                task_id: id.to_string(),
            });
        }

        let current = self.task(id)?.status;
        if !current.can_transition_to(next) {
            return Err(KiroError::InvalidTransition {
                task_id: id.to_string(),
                from: format!("{current:?}"),
                to: format!("{next:?}"),
            });
        }

        if next == TaskStatus::Completed {
            self.assert_parent_completion_invariant(id)?;
        }

        let backups_dir = self.config.backups_dir();
        atomic::update_checkbox(
            &self.tasks_path,
            id,
            next,
            Some(backups_dir.as_path()),
            Some(self.config.backup_keep),
        )?;

        let task = self
            .spec
            .task_mut(id)
            .ok_or_else(|| KiroError::Internal(format!("no such task: {id}")))?;
        task.status = next;

        match next {
            TaskStatus::InProgress => self.state.current_task = Some(id.to_string()),
            TaskStatus::Completed => {
                self.state.completed_tasks.insert(id.to_string());
                if self.state.current_task.as_deref() == Some(id) {
                    self.state.current_task = None;
                }
            }
            TaskStatus::NotStarted => {
                if self.state.current_task.as_deref() == Some(id) {
                    self.state.current_task = None;
                }
            }
            TaskStatus::Queued => {}
        }
        self.persist_state()?;

        let timestamp = Utc::now();
        let event = match next {
            TaskStatus::InProgress => OrchestratorEvent::TaskStarted {
                task_id: id.to_string(),
                timestamp,
            },
            TaskStatus::Completed => OrchestratorEvent::TaskCompleted {
                task_id: id.to_string(),
                timestamp,
            },
            _ => return Ok(()),
        };
        self.events.emit(&event);
        Ok(())
    }

    /// I3 is enforced structurally: the automaton only allows one task at a
    /// time into `InProgress` from `Queued`, and `current_task` tracks it,
    /// but callers invoking `start` on a second task while one is already
    /// `InProgress` get rejected here before the transition is attempted.
    pub fn queue(&mut self, id: &str) -> Result<(), KiroError> {
        self.transition(id, TaskStatus::Queued)
    }

    pub fn start(&mut self, id: &str) -> Result<(), KiroError> {
        if let Some(current) = self.state.current_task.clone() {
            if current != id
                && self
                    .task(&current)
                    .map_or(false, |t| t.status == TaskStatus::InProgress)
            {
                return Err(KiroError::InvalidTransition {
                    task_id: id.to_string(),
                    from: "NotStarted".to_string(),
                    to: "InProgress (another task is already in progress)".to_string(),
                });
            }
        }
        self.transition(id, TaskStatus::InProgress)
    }

    fn assert_parent_completion_invariant(&self, id: &str) -> Result<(), KiroError> {
        let task = self.task(id)?;
        for child_id in &task.children {
            if let Some(child) = self.spec.task(child_id) {
                if !child.optional && child.status != TaskStatus::Completed {
                    return Err(KiroError::InvalidTransition {
                        task_id: id.to_string(),
                        from: "InProgress".to_string(),
                        to: format!(
                            "Completed (blocked: non-optional child {} is not completed)",
                            child.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn complete(&mut self, id: &str) -> Result<(), KiroError> {
        self.transition(id, TaskStatus::Completed)
    }

    /// Used only by the self-correction loop, per I4's single reset edge.
    pub fn reset(&mut self, id: &str) -> Result<(), KiroError> {
        self.transition(id, TaskStatus::NotStarted)
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.state.attempts_for(id)
    }

    /// Increments the Ralph-Loop attempt counter for `id` and persists the
    /// change. Returns the new count. The counter itself is allowed to
    /// reach `MaxAttempts`; it is the caller's responsibility to treat that
    /// as exhaustion (I6, P9) and stop mutating the task further.
    pub fn increment_attempts(&mut self, id: &str) -> Result<u32, KiroError> {
        let count = self.state.ralph_loop_attempts.entry(id.to_string()).or_insert(0);
        *count += 1;
        let new_count = *count;
        self.persist_state()?;
        Ok(new_count)
    }

    pub fn reset_attempts(&mut self, id: &str) -> Result<(), KiroError> {
        self.state.ralph_loop_attempts.remove(id);
        self.persist_state()?;
        Ok(())
    }

    pub fn mark_skipped(&mut self, id: &str) -> Result<(), KiroError> {
        self.state.skipped_tasks.insert(id.to_string());
        self.persist_state()?;
        Ok(())
    }

    /// I3 check usable independently of a transition attempt.
    pub fn in_progress_count(&self) -> usize {
        self.spec
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count()
    }

    /// Crash recovery: any task left `InProgress` at load time can only be
    /// a crash artifact (I3); reset it so selection resumes cleanly.
    pub fn recover_from_crash(&mut self) -> Result<(), KiroError> {
        let stuck: Vec<String> = self
            .spec
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .collect();
        for id in stuck {
            self.reset(&id)?;
        }
        Ok(())
    }

    pub fn clear_execution_pointer(&mut self) -> Result<(), KiroError> {
        self.state.current_spec = None;
        self.state.current_task = None;
        self.state.execution_start_time = None;
        self.persist_state()?;
        Ok(())
    }
}
