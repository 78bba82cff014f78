//! The bounded self-correction engine: classify a failure, pick a target
//! spec file, propose and validate a textual correction, apply it, and let
//! the task be retried.

use crate::atomic::{self, CreatePolicy};
use crate::error::RalphLoopError;
use crate::model::ParsedSpec;
use crate::parser;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;

/// The error-kind taxonomy the classifier assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TestFailure,
    CompilationError,
    RuntimeError,
    MissingDependency,
    InvalidSpec,
    TimeoutError,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TestFailure => "test_failure",
            ErrorKind::CompilationError => "compilation_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::MissingDependency => "missing_dependency",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::UnknownError => "unknown_error",
        }
    }
}

/// Input to the classifier and correction generator (§4.5 "Error context").
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub task_id: String,
    pub message: String,
    pub stack: Option<String>,
    pub failed_test: Option<String>,
    pub timestamp: DateTime<Utc>,
}

const TEST_KEYWORDS: &[&str] = &["assert", "expect(", "toequal", "toeq", "test failed", "mismatch"];
const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "etimedout"];
const MISSING_DEP_PATTERNS: &[&str] = &[
    "cannot find module",
    "module not found",
    "no such file or directory",
    "unresolved import",
    "package not found",
];
const RUNTIME_PATTERNS: &[&str] = &[
    "null pointer",
    "undefined is not a function",
    "panicked at",
    "segmentation fault",
    "index out of bounds",
    "division by zero",
];
const COMPILATION_PATTERNS: &[&str] = &[
    "syntax error",
    "expected expression",
    "unexpected token",
    "type error",
    "cannot find type",
    "mismatched types",
];

/// Classifies an error context into an `ErrorKind`. Pure function of the
/// input; no hidden state (P10). Evaluation order matters: timeout,
/// missing-dependency, and runtime patterns are checked before compilation
/// patterns so a missing module is never misclassified as a test failure,
/// and a bare `failed_test` never boosts `TestFailure` without
/// corroborating keywords in the message.
pub fn classify(ctx: &ErrorContext) -> ErrorKind {
    let haystack = format!(
        "{} {}",
        ctx.message.to_lowercase(),
        ctx.stack.as_deref().unwrap_or("").to_lowercase()
    );

    if TIMEOUT_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return ErrorKind::TimeoutError;
    }
    if MISSING_DEP_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return ErrorKind::MissingDependency;
    }
    if RUNTIME_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return ErrorKind::RuntimeError;
    }
    if COMPILATION_PATTERNS.iter().any(|p| haystack.contains(p)) {
        return ErrorKind::CompilationError;
    }
    if ctx.failed_test.is_some() && TEST_KEYWORDS.iter().any(|p| haystack.contains(p)) {
        return ErrorKind::TestFailure;
    }
    ErrorKind::UnknownError
}

/// Deterministic mapping from error kind to the spec file the correction
/// should target (§4.5 table). `InvalidSpec` picks by a structural check:
/// `requirements.md` if it no longer has any acceptance criteria, else
/// `design.md`.
pub fn target_file(kind: ErrorKind, spec: &ParsedSpec) -> &'static str {
    match kind {
        ErrorKind::TestFailure | ErrorKind::CompilationError => "design.md",
        ErrorKind::RuntimeError | ErrorKind::TimeoutError | ErrorKind::UnknownError => "tasks.md",
        ErrorKind::MissingDependency => "requirements.md",
        ErrorKind::InvalidSpec => {
            let missing_criteria = spec.requirements.iter().any(|r| r.acceptance_criteria.is_empty());
            if missing_criteria {
                "requirements.md"
            } else {
                "design.md"
            }
        }
    }
}

/// Proposes a correction to a spec file's textual content. Pluggable so an
/// LLM-backed implementation can replace the default without touching the
/// loop's control flow.
pub trait CorrectionGenerator: Send + Sync {
    fn generate(
        &self,
        ctx: &ErrorContext,
        kind: ErrorKind,
        current_content: &str,
        spec: &ParsedSpec,
    ) -> Result<String, RalphLoopError>;
}

/// Deterministic, offline-testable default generator: appends a note to the
/// section most strongly implicated by the error context, or to an
/// appendix if none is identified.
pub struct RuleBasedGenerator;

impl CorrectionGenerator for RuleBasedGenerator {
    fn generate(
        &self,
        ctx: &ErrorContext,
        kind: ErrorKind,
        current_content: &str,
        spec: &ParsedSpec,
    ) -> Result<String, RalphLoopError> {
        let note = format!(
            "\n\n<!-- ralph-loop correction {} for task {}: {} -->\n",
            ctx.timestamp.to_rfc3339(),
            ctx.task_id,
            ctx.message.lines().next().unwrap_or(&ctx.message)
        );

        if let Some(property_number) = find_implicated_property(ctx, spec) {
            let heading = format!("Property {property_number}:");
            if let Some(pos) = current_content.find(&heading) {
                let insertion = current_content[pos..]
                    .find("\n\n")
                    .map(|rel| pos + rel)
                    .unwrap_or(current_content.len());
                let mut updated = current_content.to_string();
                updated.insert_str(insertion, &note);
                return Ok(updated);
            }
        }

        if let Some(task) = spec.task(&ctx.task_id) {
            let marker = format!(" {} ", task.id);
            if let Some(pos) = current_content.find(&marker) {
                let line_end = current_content[pos..]
                    .find('\n')
                    .map(|rel| pos + rel)
                    .unwrap_or(current_content.len());
                let mut updated = current_content.to_string();
                updated.insert_str(line_end, &format!("\n  <!-- ralph-loop note: {} -->", kind.as_str()));
                return Ok(updated);
            }
        }

        let mut updated = current_content.to_string();
        if !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str("\n## Ralph-Loop Appendix\n");
        updated.push_str(&note);
        Ok(updated)
    }
}

fn find_implicated_property(ctx: &ErrorContext, spec: &ParsedSpec) -> Option<u32> {
    if let Some(test_name) = &ctx.failed_test {
        for property in &spec.properties {
            if test_name.contains(&format!("Property {}", property.number)) {
                return Some(property.number);
            }
        }
    }
    spec.properties.first().map(|p| p.number).filter(|_| {
        ctx.message.to_lowercase().contains("property")
    })
}

/// Validates a proposed correction before it is committed (§4.5 "Validation
/// before commit"). `spec` is the parsed spec as it stood before the
/// correction, used to check that cross-references into `file_name` which
/// resolved then still resolve against `after`.
pub fn validate_correction(
    file_name: &str,
    before: &str,
    after: &str,
    spec: &ParsedSpec,
) -> Result<(), RalphLoopError> {
    if after.trim().is_empty() {
        return Err(RalphLoopError::EmptyCorrection {
            file: file_name.to_string(),
        });
    }

    match file_name {
        "requirements.md" => {
            let parsed = parser::parse_requirements(after).map_err(|source| {
                RalphLoopError::InvalidResult {
                    file: file_name.to_string(),
                    source,
                }
            })?;
            if parsed.is_empty() {
                return Err(RalphLoopError::SectionRemoved {
                    file: file_name.to_string(),
                    removed: vec!["### Requirement".to_string()],
                });
            }
            let after_ids: BTreeSet<String> = parsed.iter().map(|r| r.id.clone()).collect();
            check_requirement_refs(spec, &after_ids)?;
        }
        "tasks.md" => {
            let parsed = parser::parse_tasks(after).map_err(|source| {
                RalphLoopError::InvalidResult {
                    file: file_name.to_string(),
                    source,
                }
            })?;
            if parsed.is_empty() {
                return Err(RalphLoopError::SectionRemoved {
                    file: file_name.to_string(),
                    removed: vec!["task list".to_string()],
                });
            }
        }
        "design.md" => {
            let parsed =
                parser::parse_properties(after).map_err(|source| RalphLoopError::InvalidResult {
                    file: file_name.to_string(),
                    source,
                })?;
            let after_ids: BTreeSet<String> =
                parsed.iter().map(|p| p.number.to_string()).collect();
            check_property_refs(spec, &after_ids)?;
        }
        _ => {}
    }

    let before_sections = section_headers(before);
    let after_sections = section_headers(after);
    let removed: Vec<String> = before_sections.difference(&after_sections).cloned().collect();
    if !removed.is_empty() {
        return Err(RalphLoopError::SectionRemoved {
            file: file_name.to_string(),
            removed,
        });
    }

    Ok(())
}

/// Step 3 of §4.5's validation for a `requirements.md` correction: any task
/// or property requirement-ref that resolved against `spec` must still
/// resolve against the new set of requirement ids. New ids introduced by the
/// correction are unconstrained.
fn check_requirement_refs(spec: &ParsedSpec, after_ids: &BTreeSet<String>) -> Result<(), RalphLoopError> {
    for task in &spec.tasks {
        for reference in &task.requirement_refs {
            if spec.requirement(reference).is_some() && !after_ids.contains(reference) {
                return Err(RalphLoopError::BrokenReference {
                    file: "requirements.md".to_string(),
                    reference: reference.clone(),
                });
            }
        }
    }
    for property in &spec.properties {
        for reference in &property.requirement_refs {
            if spec.requirement(reference).is_some() && !after_ids.contains(reference) {
                return Err(RalphLoopError::BrokenReference {
                    file: "requirements.md".to_string(),
                    reference: reference.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Step 3 of §4.5's validation for a `design.md` correction: any task
/// property-ref that resolved against `spec` must still resolve against the
/// new set of property numbers.
fn check_property_refs(spec: &ParsedSpec, after_ids: &BTreeSet<String>) -> Result<(), RalphLoopError> {
    for task in &spec.tasks {
        for reference in &task.property_refs {
            let resolved_before = reference
                .parse::<u32>()
                .ok()
                .is_some_and(|n| spec.property(n).is_some());
            if resolved_before && !after_ids.contains(reference) {
                return Err(RalphLoopError::BrokenReference {
                    file: "design.md".to_string(),
                    reference: reference.clone(),
                });
            }
        }
    }
    Ok(())
}

fn section_headers(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter(|l| l.trim_start().starts_with('#'))
        .map(|l| l.trim().to_string())
        .collect()
}

/// Applies a validated correction to `target_file` under `spec_dir` via
/// atomic-write-with-backup. `backup_dir`/`keep` carry the configured backup
/// location and retention count; `None` falls back to the engine's defaults.
pub fn apply_correction(
    spec_dir: &Path,
    target_file: &str,
    new_content: &str,
    backup_dir: Option<&Path>,
    keep: Option<usize>,
) -> Result<(), crate::error::AtomicFileError> {
    let path = spec_dir.join(target_file);
    atomic::atomic_write_with_backup(
        &path,
        new_content.as_bytes(),
        None,
        CreatePolicy::FailIfMissing,
        backup_dir,
        keep,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ctx(message: &str, failed_test: Option<&str>) -> ErrorContext {
        ErrorContext {
            task_id: "3.1".to_string(),
            message: message.to_string(),
            stack: None,
            failed_test: failed_test.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn classifies_timeout_before_anything_else() {
        let c = ctx("Error: operation timed out while compiling", Some("some test"));
        assert_eq!(classify(&c), ErrorKind::TimeoutError);
    }

    #[test]
    fn classifies_missing_dependency() {
        let c = ctx("Cannot find module 'left-pad'", None);
        assert_eq!(classify(&c), ErrorKind::MissingDependency);
    }

    #[test]
    fn missing_dependency_not_misclassified_as_test_failure() {
        let c = ctx("Cannot find module 'left-pad'", Some("unit test for pad"));
        assert_eq!(classify(&c), ErrorKind::MissingDependency);
    }

    #[test]
    fn failed_test_alone_does_not_force_test_failure() {
        let c = ctx("something vague went wrong", Some("some test name"));
        assert_eq!(classify(&c), ErrorKind::UnknownError);
    }

    #[test]
    fn test_failure_requires_keywords_and_failed_test() {
        let c = ctx("AssertionError: expected 1 to equal 2", Some("adds numbers"));
        assert_eq!(classify(&c), ErrorKind::TestFailure);
    }

    #[test]
    fn target_file_table_matches_spec() {
        let spec = ParsedSpec {
            feature_name: "x".into(),
            requirements: vec![],
            properties: vec![],
            tasks: vec![],
        };
        assert_eq!(target_file(ErrorKind::TestFailure, &spec), "design.md");
        assert_eq!(target_file(ErrorKind::CompilationError, &spec), "design.md");
        assert_eq!(target_file(ErrorKind::RuntimeError, &spec), "tasks.md");
        assert_eq!(target_file(ErrorKind::MissingDependency, &spec), "requirements.md");
        assert_eq!(target_file(ErrorKind::TimeoutError, &spec), "tasks.md");
        assert_eq!(target_file(ErrorKind::UnknownError, &spec), "tasks.md");
    }

    fn empty_spec() -> ParsedSpec {
        ParsedSpec {
            feature_name: "x".into(),
            requirements: vec![],
            properties: vec![],
            tasks: vec![],
        }
    }

    #[test]
    fn validate_rejects_empty_correction() {
        let err =
            validate_correction("tasks.md", "- [ ] 1 A\n", "", &empty_spec()).unwrap_err();
        assert!(matches!(err, RalphLoopError::EmptyCorrection { .. }));
    }

    #[test]
    fn validate_rejects_removed_section() {
        let before = "## Keep\nbody\n## Also Keep\nbody\n";
        let after = "## Keep\nbody\n";
        let err = validate_correction("design.md", before, after, &empty_spec()).unwrap_err();
        assert!(matches!(err, RalphLoopError::SectionRemoved { .. }));
    }

    #[test]
    fn validate_accepts_additive_correction() {
        let before = "## Keep\nbody\n";
        let after = "## Keep\nbody\n\n## New\nmore\n";
        validate_correction("design.md", before, after, &empty_spec()).unwrap();
    }

    #[test]
    fn validate_rejects_broken_requirement_reference() {
        use crate::model::Task;
        let spec = ParsedSpec {
            feature_name: "x".into(),
            requirements: vec![crate::model::Requirement {
                id: "1".into(),
                user_story: "story".into(),
                acceptance_criteria: vec!["works".into()],
            }],
            properties: vec![],
            tasks: vec![Task::new("1.1", "do thing")
                .with_requirement_refs(vec!["1".into()])],
        };
        let before = "### Requirement 1\n\n**User Story:** story\n\n#### Acceptance Criteria\n\n1. works\n";
        let after = "### Requirement 2\n\n**User Story:** other\n\n#### Acceptance Criteria\n\n1. other\n";
        let err = validate_correction("requirements.md", before, after, &spec).unwrap_err();
        assert!(matches!(err, RalphLoopError::BrokenReference { .. }));
    }

    #[test]
    fn validate_accepts_requirement_correction_that_keeps_referenced_id() {
        use crate::model::Task;
        let spec = ParsedSpec {
            feature_name: "x".into(),
            requirements: vec![crate::model::Requirement {
                id: "1".into(),
                user_story: "story".into(),
                acceptance_criteria: vec!["works".into()],
            }],
            properties: vec![],
            tasks: vec![Task::new("1.1", "do thing")
                .with_requirement_refs(vec!["1".into()])],
        };
        let before = "### Requirement 1\n\n**User Story:** story\n\n#### Acceptance Criteria\n\n1. works\n";
        let after = "### Requirement 1\n\n**User Story:** story, refined\n\n#### Acceptance Criteria\n\n1. works\n2. and more\n";
        validate_correction("requirements.md", before, after, &spec).unwrap();
    }

    #[test]
    fn rule_based_generator_attaches_note_to_implicated_property() {
        let spec = ParsedSpec {
            feature_name: "x".into(),
            requirements: vec![],
            properties: vec![crate::model::Property {
                number: 5,
                title: "Retries".into(),
                statement: "stmt".into(),
                requirement_refs: vec![],
            }],
            tasks: vec![],
        };
        let content = "### Property 5: Retries\n\nBody text.\n\n### Property 6: Other\n\nOther body.\n";
        let c = ctx("boom", Some("Property 5 retry test"));
        let result = RuleBasedGenerator.generate(&c, ErrorKind::TestFailure, content, &spec).unwrap();
        assert!(result.contains("ralph-loop correction"));
        assert!(result.starts_with("### Property 5"));
    }
}
