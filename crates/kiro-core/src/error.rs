//! Typed error taxonomy for the orchestrator core.
//!
//! Every public operation returns a `Result<_, KiroError>`. `KiroError`
//! wraps the per-subsystem error enums via `#[from]` so callers can match
//! on `kind()` without caring which subsystem raised it, and so each
//! subsystem's own error type stays small and local like `git_ops::GitOpsError`
//! and `loop_registry::RegistryError` do in the codebase this design is
//! descended from.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse-grained error kind, matching the taxonomy every public operation
/// surfaces to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    FileError,
    ValidationError,
    Timeout,
    InvalidTransition,
    Exhausted,
    Cancelled,
    Internal,
}

/// Top-level error type for `kiro-core`.
#[derive(Debug, Error)]
pub enum KiroError {
    #[error(transparent)]
    Atomic(#[from] AtomicFileError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    TestRunner(#[from] TestRunnerError),

    #[error(transparent)]
    RalphLoop(#[from] RalphLoopError),

    #[error("invalid status transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("task {task_id} is exhausted: attempt counter exceeded MaxAttempts")]
    Exhausted { task_id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl KiroError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KiroError::Atomic(_) => ErrorKind::FileError,
            KiroError::Parse(_) => ErrorKind::ParseError,
            KiroError::TestRunner(e) if matches!(e, TestRunnerError::Timeout { .. }) => {
                ErrorKind::Timeout
            }
            KiroError::TestRunner(_) => ErrorKind::Internal,
            KiroError::RalphLoop(_) => ErrorKind::ValidationError,
            KiroError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            KiroError::Exhausted { .. } => ErrorKind::Exhausted,
            KiroError::Cancelled => ErrorKind::Cancelled,
            KiroError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Errors raised by the atomic file substrate.
#[derive(Debug, Error)]
pub enum AtomicFileError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("content validation failed for {path}: {message}")]
    ValidationFailed { path: PathBuf, message: String },

    #[error("failed to rename temp file into place at {path}: {source}")]
    RenameFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create backup of {path}: {message}")]
    BackupFailed { path: PathBuf, message: String },

    #[error("no checkbox line found for task {task_id} in {path}")]
    TaskNotFound { task_id: String, path: PathBuf },
}

/// Errors raised by the spec parser.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{file}: missing file")]
    MissingFile { file: String },

    #[error("{file}:{line}: {message}")]
    Malformed {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}: duplicate task ids: {}", .ids.join(", "))]
    DuplicateTaskIds { file: String, ids: Vec<String> },

    #[error("{file}: unresolved cross-reference {reference} on task {task_id}")]
    UnresolvedReference {
        file: String,
        task_id: String,
        reference: String,
    },
}

/// Errors raised by the test runner.
#[derive(Debug, Error)]
pub enum TestRunnerError {
    #[error("failed to spawn test command {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("test run timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("could not parse test output as JSON or recognizable text: {message}")]
    UnparseableOutput { message: String },
}

/// Errors raised by the self-correction engine.
#[derive(Debug, Error)]
pub enum RalphLoopError {
    #[error("task {task_id} exhausted its attempt budget of {max_attempts}")]
    Exhausted { task_id: String, max_attempts: u32 },

    #[error("proposed correction to {file} was empty")]
    EmptyCorrection { file: String },

    #[error("proposed correction to {file} would remove section(s): {}", .removed.join(", "))]
    SectionRemoved { file: String, removed: Vec<String> },

    #[error("proposed correction to {file} broke cross-reference {reference}")]
    BrokenReference { file: String, reference: String },

    #[error("proposed correction to {file} no longer parses: {source}")]
    InvalidResult {
        file: String,
        #[source]
        source: ParseError,
    },
}
