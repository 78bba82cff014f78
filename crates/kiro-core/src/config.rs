//! Engine configuration.
//!
//! Mirrors the teacher's config pattern of a single struct with
//! `#[serde(default)]` on every field so a partial or absent config file
//! degrades gracefully to sane defaults rather than failing to deserialize.

use serde::{Deserialize, Serialize};

fn default_max_attempts() -> u32 {
    3
}

fn default_test_timeout_secs() -> u64 {
    30
}

fn default_kill_grace_ms() -> u64 {
    250
}

fn default_backup_keep() -> usize {
    10
}

fn default_property_min_iterations() -> u32 {
    100
}

fn default_test_command() -> Vec<String> {
    Vec::new()
}

/// Tunables for the orchestrator core. Every field has a default so
/// `EngineConfig::default()` and a partially-specified JSON/TOML document
/// both produce a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum Ralph-Loop correction attempts per task before exhaustion.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout for a single test-runner invocation.
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,

    /// Grace period between graceful termination and a hard kill of a
    /// timed-out test subprocess.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Number of backups retained per source file.
    #[serde(default = "default_backup_keep")]
    pub backup_keep: usize,

    /// Minimum property-generator iterations a property test must declare
    /// to avoid a (non-fatal) warning.
    #[serde(default = "default_property_min_iterations")]
    pub property_min_iterations: u32,

    /// Working directory containing `.kiro/`. Defaults to the process's
    /// current directory at config-load time.
    #[serde(default)]
    pub workdir: Option<std::path::PathBuf>,

    /// External test command to spawn for test tasks, e.g.
    /// `["npx", "vitest", "run", "--reporter=json"]`. Empty means no test
    /// infrastructure is configured; the orchestrator then skips actual
    /// subprocess invocation for test tasks and logs a warning rather than
    /// fabricating a result.
    #[serde(default = "default_test_command")]
    pub test_command: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            test_timeout_secs: default_test_timeout_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            backup_keep: default_backup_keep(),
            property_min_iterations: default_property_min_iterations(),
            workdir: None,
            test_command: default_test_command(),
        }
    }
}

impl EngineConfig {
    pub fn workdir(&self) -> std::path::PathBuf {
        self.workdir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    }

    pub fn specs_dir(&self) -> std::path::PathBuf {
        self.workdir().join(".kiro").join("specs")
    }

    pub fn state_path(&self) -> std::path::PathBuf {
        self.workdir()
            .join(".kiro")
            .join("state")
            .join("orchestrator-state.json")
    }

    pub fn backups_dir(&self) -> std::path::PathBuf {
        self.workdir().join(".kiro").join("backups")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backup_keep, 10);
        assert_eq!(config.property_min_iterations, 100);
        assert!(config.test_command.is_empty());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.test_timeout_secs, 30);
    }

    #[test]
    fn derives_kiro_paths_from_workdir() {
        let mut config = EngineConfig::default();
        config.workdir = Some("/tmp/project".into());
        assert_eq!(
            config.state_path(),
            std::path::PathBuf::from("/tmp/project/.kiro/state/orchestrator-state.json")
        );
    }
}
