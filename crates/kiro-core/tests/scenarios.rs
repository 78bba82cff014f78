//! End-to-end scenario tests exercising the Task Manager and Ralph-Loop
//! together, without going through the full `Orchestrator::run` subprocess
//! path (that is covered separately by orchestrator's own inline tests).

use kiro_core::config::EngineConfig;
use kiro_core::events::EventBus;
use kiro_core::model::TaskStatus;
use kiro_core::ralph_loop::{self, CorrectionGenerator, ErrorContext, RuleBasedGenerator};
use kiro_core::task_manager::TaskManager;
use kiro_core::KiroError;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn write_spec(dir: &std::path::Path, tasks_md: &str) {
    fs::write(
        dir.join("requirements.md"),
        "### Requirement 1\n\n**User Story:** As a user, I want reliable retries.\n\n#### Acceptance Criteria\n\n1. Retries succeed eventually\n",
    )
    .unwrap();
    fs::write(
        dir.join("design.md"),
        "### Property 5: Retries are idempotent\n\nRetrying an operation twice has the same\neffect as retrying it once.\n\nValidates: Requirements 1\n",
    )
    .unwrap();
    fs::write(dir.join("tasks.md"), tasks_md).unwrap();
}

fn load_manager(spec_dir: &std::path::Path, workdir: &std::path::Path) -> TaskManager {
    let mut config = EngineConfig::default();
    config.workdir = Some(workdir.to_path_buf());
    TaskManager::load(spec_dir, "demo", config, Arc::new(EventBus::new())).unwrap()
}

/// S2: a failing test tagged `Property 5` targets `design.md`, attaches
/// exactly one note inside that property's paragraph, bumps the attempt
/// counter to 1, and resets the task for retry.
#[test]
fn s2_test_failure_targets_design_and_attaches_one_note() {
    let workdir = TempDir::new().unwrap();
    let spec_dir = workdir.path().join("spec");
    fs::create_dir_all(&spec_dir).unwrap();
    write_spec(&spec_dir, "- [ ] 3.1 Write retry test _Validates: Property 5_\n");

    let mut manager = load_manager(&spec_dir, workdir.path());
    manager.queue("3.1").unwrap();
    manager.start("3.1").unwrap();

    let ctx = ErrorContext {
        task_id: "3.1".to_string(),
        message: "AssertionError: expected retry count to equal 1, got 2".to_string(),
        stack: None,
        failed_test: Some("Property 5 retry idempotence".to_string()),
        timestamp: chrono::Utc::now(),
    };

    let kind = ralph_loop::classify(&ctx);
    assert_eq!(kind.as_str(), "test_failure");
    let target = ralph_loop::target_file(kind, manager.spec());
    assert_eq!(target, "design.md");

    let attempt = manager.increment_attempts("3.1").unwrap();
    assert_eq!(attempt, 1);

    let design_path = spec_dir.join("design.md");
    let before = fs::read_to_string(&design_path).unwrap();
    let after = RuleBasedGenerator.generate(&ctx, kind, &before, manager.spec()).unwrap();
    ralph_loop::validate_correction(target, &before, &after, manager.spec()).unwrap();
    ralph_loop::apply_correction(&spec_dir, target, &after, None, None).unwrap();

    let note_count = after.matches("ralph-loop correction").count();
    assert_eq!(note_count, 1);

    manager.reset("3.1").unwrap();
    assert_eq!(manager.spec().task("3.1").unwrap().status, TaskStatus::NotStarted);
    assert_eq!(manager.attempts("3.1"), 1);
}

/// S3: a runtime error in task `2` targets `tasks.md`; after three failed
/// attempts the task is exhausted and further mutation is rejected. A
/// fresh load after "restart" still reports the task as exhausted.
#[test]
fn s3_runtime_error_exhausts_after_max_attempts() {
    let workdir = TempDir::new().unwrap();
    let spec_dir = workdir.path().join("spec");
    fs::create_dir_all(&spec_dir).unwrap();
    write_spec(&spec_dir, "- [ ] 1 Setup\n- [ ] 2 Do risky thing\n");

    let mut manager = load_manager(&spec_dir, workdir.path());

    let ctx = ErrorContext {
        task_id: "2".to_string(),
        message: "panicked at 'index out of bounds', src/main.rs:42".to_string(),
        stack: None,
        failed_test: None,
        timestamp: chrono::Utc::now(),
    };
    let kind = ralph_loop::classify(&ctx);
    assert_eq!(kind.as_str(), "runtime_error");
    assert_eq!(ralph_loop::target_file(kind, manager.spec()), "tasks.md");

    manager.queue("2").unwrap();
    manager.start("2").unwrap();

    for expected_attempt in 1..=3u32 {
        let attempt = manager.increment_attempts("2").unwrap();
        assert_eq!(attempt, expected_attempt);
        if attempt < 3 {
            manager.reset("2").unwrap();
            manager.queue("2").unwrap();
            manager.start("2").unwrap();
        }
    }

    // Attempt counter has reached MaxAttempts; any further mutation is
    // rejected and the engine would halt with a terminal error here.
    let err = manager.reset("2").unwrap_err();
    assert!(matches!(err, KiroError::Exhausted { .. }));

    // "Restart": reload the manager from disk. Attempt counters persist
    // unchanged across a restart; the operator must reset them explicitly
    // before task 2 can be attempted again.
    let mut reloaded = load_manager(&spec_dir, workdir.path());
    assert_eq!(reloaded.attempts("2"), 3, "a restart preserves the persisted attempt counter");
    let err = reloaded.queue("2").unwrap_err();
    assert!(matches!(err, KiroError::Exhausted { .. }));

    reloaded.reset_attempts("2").unwrap();
    assert_eq!(reloaded.attempts("2"), 0);
}

/// S4: concurrent writes to `tasks.md` from independent callers are
/// serialized; the final content is exactly one caller's write, and no
/// reader observes a half-written file.
#[test]
fn s4_concurrent_checkbox_updates_are_serialized() {
    use std::sync::Barrier;
    use std::thread;

    let workdir = TempDir::new().unwrap();
    let spec_dir = workdir.path().join("spec");
    fs::create_dir_all(&spec_dir).unwrap();
    write_spec(&spec_dir, "- [ ] 1 A\n- [ ] 2 B\n- [ ] 3 C\n");
    let tasks_path = Arc::new(spec_dir.join("tasks.md"));

    let barrier = Arc::new(Barrier::new(3));
    let handles: Vec<_> = ["1", "2", "3"]
        .iter()
        .map(|id| {
            let tasks_path = tasks_path.clone();
            let barrier = barrier.clone();
            let id = id.to_string();
            thread::spawn(move || {
                barrier.wait();
                kiro_core::atomic::update_checkbox(&tasks_path, &id, TaskStatus::Completed, None, None)
                    .unwrap();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let final_content = fs::read_to_string(&*tasks_path).unwrap();
    assert_eq!(final_content.matches("[x]").count(), 3);
    assert_eq!(final_content.lines().count(), 3);
}
