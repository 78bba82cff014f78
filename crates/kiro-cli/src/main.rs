//! # kiro-cli
//!
//! Binary entry point for the orchestrator core.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Application initialization and structured logging
//! - Entry point to the headless orchestration loop
//! - Status reporting and attempt-counter reset for a stalled run

mod process_management;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiro_core::{
    AuditLog, CancellationToken, EngineConfig, EventBus, Orchestrator, TaskManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "kiro", about = "Spec-driven development orchestrator", version)]
struct Cli {
    /// Working directory containing `.kiro/`. Defaults to the current directory.
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Maximum Ralph-Loop correction attempts per task before exhaustion.
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// External test command to run for test tasks, given as a single
    /// whitespace-separated string, e.g. `"npx vitest run --reporter=json"`.
    /// Omit to skip test execution entirely (code-generation tasks still run).
    #[arg(long = "test-cmd", global = true)]
    test_cmd: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a feature's spec to completion.
    Run {
        /// Feature directory name under `.kiro/specs/`.
        feature: String,
    },
    /// Print the current run's status snapshot as JSON.
    Status {
        feature: String,
    },
    /// Clear a task's Ralph-Loop attempt counter so it can be re-run after
    /// exhaustion halted the engine.
    ResetAttempts {
        feature: String,
        task_id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    process_management::setup_process_group();

    let cli = Cli::parse();

    let mut config = EngineConfig::default();
    config.workdir = Some(cli.workdir.unwrap_or_else(|| PathBuf::from(".")));
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(test_cmd) = cli.test_cmd {
        config.test_command = test_cmd.split_whitespace().map(str::to_string).collect();
    }

    match cli.command {
        Command::Run { feature } => run(&feature, config),
        Command::Status { feature } => status(&feature, config),
        Command::ResetAttempts { feature, task_id } => reset_attempts(&feature, &task_id, config),
    }
}

fn spec_dir(config: &EngineConfig, feature: &str) -> PathBuf {
    config.specs_dir().join(feature)
}

fn run(feature: &str, config: EngineConfig) -> Result<()> {
    let dir = spec_dir(&config, feature);
    let events = Arc::new(EventBus::new());
    events.add_listener(|event| {
        info!(?event, "orchestrator event");
    });

    let manager = TaskManager::load(&dir, feature, config.clone(), events.clone())
        .with_context(|| format!("failed to load spec for feature '{feature}'"))?;

    let mut orchestrator = Orchestrator::new(
        manager,
        dir,
        config,
        events,
        Arc::new(AuditLog::new()),
        CancellationToken::new(),
        None,
    );

    let outcome = orchestrator.run();
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.success {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn status(feature: &str, config: EngineConfig) -> Result<()> {
    let state = TaskManager::load_persisted_state(&config.state_path());
    if state.current_spec.as_deref() != Some(feature) {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "currentSpec": null,
                "message": "no active run for this feature",
            }))?
        );
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn reset_attempts(feature: &str, task_id: &str, config: EngineConfig) -> Result<()> {
    let dir = spec_dir(&config, feature);
    let events = Arc::new(EventBus::new());
    let mut manager = TaskManager::load(&dir, feature, config, events)
        .with_context(|| format!("failed to load spec for feature '{feature}'"))?;
    manager.reset_attempts(task_id)?;
    println!("attempt counter for task {task_id} reset");
    Ok(())
}
