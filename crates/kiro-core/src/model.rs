//! Core data types: tasks, requirements, properties, and the persisted
//! execution state.
//!
//! Mirrors the shape described for a spec-driven workflow: a flat task list
//! with parent/children links (rather than an owning tree) so hierarchy
//! queries stay simple traversals over a `Vec`, plus cross-reference lists
//! extracted from trailing Markdown annotations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Status of a task, confined to the automaton
/// `NotStarted -> Queued -> InProgress -> Completed`, plus the single reset
/// edge `InProgress -> NotStarted` used by the self-correction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Queued,
    InProgress,
    Completed,
}

impl TaskStatus {
    /// Checkbox marker character used in `tasks.md` for this status.
    pub fn marker(self) -> char {
        match self {
            TaskStatus::NotStarted => ' ',
            TaskStatus::Queued => '~',
            TaskStatus::InProgress => '>',
            TaskStatus::Completed => 'x',
        }
    }

    /// Parses a checkbox marker character into a status.
    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            ' ' => Some(TaskStatus::NotStarted),
            '~' => Some(TaskStatus::Queued),
            '>' => Some(TaskStatus::InProgress),
            'x' | 'X' => Some(TaskStatus::Completed),
            _ => None,
        }
    }

    /// Returns true if `self -> next` is a permitted transition (I4).
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::{Completed, InProgress, NotStarted, Queued};
        matches!(
            (self, next),
            (NotStarted, Queued)
                | (Queued, InProgress)
                | (InProgress, Completed)
                | (InProgress, NotStarted)
        )
    }
}

/// A single checkbox item from `tasks.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Dotted numeric id, e.g. `3`, `3.1`, `3.1.2`. Trailing periods and
    /// checkbox decoration are stripped at parse time.
    pub id: String,

    pub description: String,

    pub status: TaskStatus,

    /// True iff the source checkbox carries a trailing `*`.
    pub optional: bool,

    pub parent: Option<String>,

    #[serde(default)]
    pub children: Vec<String>,

    /// Ids extracted from a trailing `_Requirements: a.b, c.d_` annotation.
    #[serde(default)]
    pub requirement_refs: Vec<String>,

    /// Ids extracted from a trailing `_Validates: Requirements a.b_` or bare
    /// `Property N` annotation.
    #[serde(default)]
    pub property_refs: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::NotStarted,
            optional: false,
            parent: None,
            children: Vec::new(),
            requirement_refs: Vec::new(),
            property_refs: Vec::new(),
        }
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_parent(mut self, parent: Option<String>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_requirement_refs(mut self, refs: Vec<String>) -> Self {
        self.requirement_refs = refs;
        self
    }

    pub fn with_property_refs(mut self, refs: Vec<String>) -> Self {
        self.property_refs = refs;
        self
    }

    /// Depth in the hierarchy implied by the number of dots in the id, used
    /// only for display; the authoritative hierarchy is `parent`/`children`.
    pub fn depth(&self) -> usize {
        self.id.matches('.').count()
    }
}

/// A single `### Requirement <id>` section from `requirements.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub user_story: String,
    pub acceptance_criteria: Vec<String>,
}

/// A single `Property <N>:` block from `design.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub number: u32,
    pub title: String,
    pub statement: String,
    pub requirement_refs: Vec<String>,
}

/// The fully parsed triple of spec files for one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedSpec {
    pub feature_name: String,
    pub requirements: Vec<Requirement>,
    pub properties: Vec<Property>,
    /// Flat, in document order; hierarchy lives in `parent`/`children`.
    pub tasks: Vec<Task>,
}

impl ParsedSpec {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn requirement(&self, id: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.id == id)
    }

    pub fn property(&self, number: u32) -> Option<&Property> {
        self.properties.iter().find(|p| p.number == number)
    }

    /// I1: the set of task ids must be unique. Returns the duplicates found.
    pub fn duplicate_task_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut dupes = Vec::new();
        for task in &self.tasks {
            if !seen.insert(task.id.clone()) {
                dupes.push(task.id.clone());
            }
        }
        dupes
    }
}

/// Persisted execution state, written through the atomic file substrate on
/// every mutation. Unknown fields are ignored on read; missing fields
/// default to empty, matching the forward-compatibility rule for the
/// on-disk JSON shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorState {
    #[serde(rename = "currentSpec")]
    pub current_spec: Option<String>,

    #[serde(rename = "currentTask")]
    pub current_task: Option<String>,

    #[serde(rename = "executionStartTime")]
    pub execution_start_time: Option<String>,

    #[serde(rename = "ralphLoopAttempts", default)]
    pub ralph_loop_attempts: BTreeMap<String, u32>,

    #[serde(rename = "completedTasks", default)]
    pub completed_tasks: BTreeSet<String>,

    #[serde(rename = "skippedTasks", default)]
    pub skipped_tasks: BTreeSet<String>,
}

impl OrchestratorState {
    pub fn attempts_for(&self, task_id: &str) -> u32 {
        self.ralph_loop_attempts.get(task_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trips() {
        for status in [
            TaskStatus::NotStarted,
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Completed,
        ] {
            assert_eq!(TaskStatus::from_marker(status.marker()), Some(status));
        }
    }

    #[test]
    fn transition_automaton_matches_i4() {
        use TaskStatus::{Completed, InProgress, NotStarted, Queued};
        assert!(NotStarted.can_transition_to(Queued));
        assert!(Queued.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(NotStarted));

        assert!(!NotStarted.can_transition_to(InProgress));
        assert!(!NotStarted.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(NotStarted));
        assert!(!Completed.can_transition_to(InProgress));
    }

    #[test]
    fn duplicate_task_ids_detected() {
        let spec = ParsedSpec {
            feature_name: "demo".into(),
            requirements: vec![],
            properties: vec![],
            tasks: vec![
                Task::new("1", "a"),
                Task::new("2", "b"),
                Task::new("1", "c"),
            ],
        };
        assert_eq!(spec.duplicate_task_ids(), vec!["1".to_string()]);
    }

    #[test]
    fn state_defaults_are_empty() {
        let state = OrchestratorState::default();
        assert!(state.current_spec.is_none());
        assert_eq!(state.attempts_for("3"), 0);
    }

    #[test]
    fn state_deserializes_with_missing_fields() {
        let json = r#"{"currentSpec": "feature-x"}"#;
        let state: OrchestratorState = serde_json::from_str(json).unwrap();
        assert_eq!(state.current_spec.as_deref(), Some("feature-x"));
        assert!(state.completed_tasks.is_empty());
        assert!(state.ralph_loop_attempts.is_empty());
    }

    #[test]
    fn state_ignores_unknown_fields() {
        let json = r#"{"currentSpec": null, "totallyUnknownField": 42}"#;
        let state: OrchestratorState = serde_json::from_str(json).unwrap();
        assert!(state.current_spec.is_none());
    }
}
