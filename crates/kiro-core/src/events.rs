//! Event kinds and the in-process observer registry that delivers them.
//!
//! Grounded on the same observer shape used for the engine's run loop
//! elsewhere in this codebase (`add_observer<F: Fn(&Event) + Send +
//! 'static>`): listeners are plain closures, registered once, and isolated
//! from each other — a panicking listener is caught and logged rather than
//! allowed to take down the run or block sibling listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

/// The event kinds external listeners may observe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskStarted {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        task_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    TestStarted {
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    TestCompleted {
        task_id: String,
        passed: u32,
        failed: u32,
        timestamp: DateTime<Utc>,
    },
    CorrectionApplied {
        task_id: String,
        target_file: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    CorrectionExhausted {
        task_id: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        success: bool,
        timestamp: DateTime<Utc>,
    },
    RunCancelled {
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::TaskStarted { task_id, .. }
            | OrchestratorEvent::TaskCompleted { task_id, .. }
            | OrchestratorEvent::TaskFailed { task_id, .. }
            | OrchestratorEvent::TestStarted { task_id, .. }
            | OrchestratorEvent::TestCompleted { task_id, .. }
            | OrchestratorEvent::CorrectionApplied { task_id, .. }
            | OrchestratorEvent::CorrectionExhausted { task_id, .. } => Some(task_id),
            OrchestratorEvent::RunCompleted { .. } | OrchestratorEvent::RunCancelled { .. } => {
                None
            }
        }
    }
}

type Listener = Box<dyn Fn(&OrchestratorEvent) + Send + 'static>;

/// Holds registered listeners and dispatches events to all of them,
/// isolating each from the others' panics.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&OrchestratorEvent) + Send + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    /// Delivers `event` to every registered listener in registration order.
    /// A listener that panics is caught and logged; it does not stop
    /// delivery to the remaining listeners.
    pub fn emit(&self, event: &OrchestratorEvent) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                tracing::warn!(?event, "event listener panicked, continuing delivery");
            }
        }
    }
}
