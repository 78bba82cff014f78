//! Markdown parsing for the three spec files into a `ParsedSpec`.
//!
//! Line-scanning plus a small set of precompiled regexes held in
//! `LazyLock` statics, the same technique used elsewhere in this codebase
//! for semi-structured Markdown (section headers, id headers, content
//! lines, metadata comments each as a named regex, flushed into a record
//! on the next section boundary or end of input).

use crate::error::ParseError;
use crate::model::{ParsedSpec, Property, Requirement, Task};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static TASK_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)-\s*\[(?P<marker>[ xX~>])\](?P<optional>\*)?\s*(?P<id>\d+(?:\.\d+)*)\.?\s+(?P<rest>.*)$")
        .unwrap()
});

static REQUIREMENTS_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_Requirements:\s*([^_]+)_").unwrap());

static VALIDATES_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_Validates:\s*Requirements\s+([^_]+)_").unwrap());

static PROPERTY_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Property\s+(\d+)").unwrap());

static REQUIREMENT_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{3,}\s*Requirement\s+(?P<id>[\d.]+)").unwrap());

static USER_STORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\*{0,2}User Story\*{0,2}:?\s*(?P<rest>.*)$").unwrap());

static ACCEPTANCE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^#{0,6}\s*\*{0,2}Acceptance Criteria\*{0,2}:?\s*$").unwrap());

static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+\.|[-*])\s+(?P<text>.+)$").unwrap());

static PROPERTY_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:#{1,6}\s*|\*{2})Property\s+(?P<num>\d+)\s*:\s*(?P<title>[^*]*?)\*{0,2}\s*$")
        .unwrap()
});

static SECTION_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,6}\s").unwrap());

static VALIDATES_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^Validates:\s*Requirements\s+(?P<ids>[\d.,\s]+)$").unwrap());

/// Parses a complete feature directory (`requirements.md`, `design.md`,
/// `tasks.md`) into a `ParsedSpec`.
pub fn parse_spec_dir(dir: &Path, feature_name: &str) -> Result<ParsedSpec, ParseError> {
    let requirements_path = dir.join("requirements.md");
    let design_path = dir.join("design.md");
    let tasks_path = dir.join("tasks.md");

    let requirements_src = read_required(&requirements_path, "requirements.md")?;
    let design_src = read_required(&design_path, "design.md")?;
    let tasks_src = read_required(&tasks_path, "tasks.md")?;

    let requirements = parse_requirements(&requirements_src)?;
    let properties = parse_properties(&design_src)?;
    let tasks = parse_tasks(&tasks_src)?;

    let spec = ParsedSpec {
        feature_name: feature_name.to_string(),
        requirements,
        properties,
        tasks,
    };

    let dupes = spec.duplicate_task_ids();
    if !dupes.is_empty() {
        return Err(ParseError::DuplicateTaskIds {
            file: "tasks.md".to_string(),
            ids: dupes,
        });
    }

    validate_references(&spec)?;

    Ok(spec)
}

fn read_required(path: &Path, name: &str) -> Result<String, ParseError> {
    std::fs::read_to_string(path).map_err(|_| ParseError::MissingFile {
        file: name.to_string(),
    })
}

/// Validates that every requirement-ref and property-ref on every task
/// resolves to an existing requirement id or property number.
fn validate_references(spec: &ParsedSpec) -> Result<(), ParseError> {
    for task in &spec.tasks {
        for req_ref in &task.requirement_refs {
            if spec.requirement(req_ref).is_none() {
                return Err(ParseError::UnresolvedReference {
                    file: "tasks.md".to_string(),
                    task_id: task.id.clone(),
                    reference: req_ref.clone(),
                });
            }
        }
        for prop_ref in &task.property_refs {
            let number: Option<u32> = prop_ref.parse().ok();
            let resolved = number.is_some_and(|n| spec.property(n).is_some());
            if !resolved {
                return Err(ParseError::UnresolvedReference {
                    file: "tasks.md".to_string(),
                    task_id: task.id.clone(),
                    reference: prop_ref.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Parses `tasks.md` into a flat, in-document-order task list with
/// `parent`/`children` links derived from indentation.
pub fn parse_tasks(markdown: &str) -> Result<Vec<Task>, ParseError> {
    let mut tasks: Vec<Task> = Vec::new();
    // Stack of (indent width, task id) for the currently open ancestors.
    let mut stack: Vec<(usize, String)> = Vec::new();

    for (line_no, raw_line) in markdown.lines().enumerate() {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let Some(caps) = TASK_LINE_RE.captures(line) else {
            continue; // narrative line, pass through silently
        };

        let indent_width = indent_width(&caps["indent"]);
        let marker = caps["marker"].chars().next().unwrap();
        let status = crate::model::TaskStatus::from_marker(marker).ok_or_else(|| {
            ParseError::Malformed {
                file: "tasks.md".to_string(),
                line: line_no + 1,
                message: format!("unrecognized checkbox marker '{marker}'"),
            }
        })?;
        let optional = caps.name("optional").is_some();
        let id = normalize_task_id(&caps["id"]);
        let rest = caps["rest"].trim();

        let (description, requirement_refs, property_refs) = extract_annotations(rest);

        while let Some((top_indent, _)) = stack.last() {
            if *top_indent >= indent_width {
                stack.pop();
            } else {
                break;
            }
        }
        let parent = stack.last().map(|(_, id)| id.clone());
        if let Some((_, parent_id)) = stack.last() {
            if let Some(parent_task) = tasks.iter_mut().find(|t| &t.id == parent_id) {
                parent_task.children.push(id.clone());
            }
        }

        tasks.push(
            Task::new(id.clone(), description)
                .with_optional(optional)
                .with_parent(parent)
                .with_requirement_refs(requirement_refs)
                .with_property_refs(property_refs),
        );

        stack.push((indent_width, id));
    }

    Ok(tasks)
}

fn indent_width(indent: &str) -> usize {
    indent
        .chars()
        .map(|c| if c == '\t' { 2 } else { 1 })
        .sum()
}

/// Strips the task id token's own trailing period (Q1): `2.` normalizes to
/// `2`, while a genuinely dotted id like `3.1` is left untouched since the
/// regex only captures `\d+(\.\d+)*` before any trailing-period stripping.
fn normalize_task_id(raw: &str) -> String {
    raw.trim_end_matches('.').to_string()
}

fn extract_annotations(rest: &str) -> (String, Vec<String>, Vec<String>) {
    let mut requirement_refs = Vec::new();
    let mut property_refs = Vec::new();

    if let Some(caps) = REQUIREMENTS_REF_RE.captures(rest) {
        requirement_refs.extend(split_ids(&caps[1]));
    }
    if let Some(caps) = VALIDATES_REF_RE.captures(rest) {
        property_refs.extend(split_ids(&caps[1]));
    } else {
        for caps in PROPERTY_TAG_RE.captures_iter(rest) {
            property_refs.push(caps[1].to_string());
        }
    }

    (rest.to_string(), requirement_refs, property_refs)
}

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

/// Parses `requirements.md` into an ordered list of `Requirement`s.
pub fn parse_requirements(markdown: &str) -> Result<Vec<Requirement>, ParseError> {
    let mut requirements = Vec::new();
    let mut current_id: Option<String> = None;
    let mut user_story = String::new();
    let mut criteria: Vec<String> = Vec::new();
    let mut in_acceptance = false;

    let flush = |requirements: &mut Vec<Requirement>,
                 current_id: &mut Option<String>,
                 user_story: &mut String,
                 criteria: &mut Vec<String>| {
        if let Some(id) = current_id.take() {
            requirements.push(Requirement {
                id,
                user_story: std::mem::take(user_story).trim().to_string(),
                acceptance_criteria: std::mem::take(criteria),
            });
        }
    };

    for line in markdown.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(caps) = REQUIREMENT_HEADER_RE.captures(line) {
            flush(&mut requirements, &mut current_id, &mut user_story, &mut criteria);
            current_id = Some(caps["id"].to_string());
            in_acceptance = false;
            continue;
        }

        if current_id.is_none() {
            continue;
        }

        if ACCEPTANCE_HEADER_RE.is_match(line) {
            in_acceptance = true;
            continue;
        }

        if let Some(caps) = USER_STORY_RE.captures(line) {
            let rest = caps["rest"].trim();
            if !rest.is_empty() {
                if !user_story.is_empty() {
                    user_story.push(' ');
                }
                user_story.push_str(rest);
            }
            in_acceptance = false;
            continue;
        }

        if in_acceptance {
            if let Some(caps) = LIST_ITEM_RE.captures(line) {
                criteria.push(caps["text"].trim().to_string());
            }
        } else if !line.trim().is_empty() && !line.trim_start().starts_with('#') {
            if !user_story.is_empty() {
                user_story.push(' ');
            }
            user_story.push_str(line.trim());
        }
    }

    flush(&mut requirements, &mut current_id, &mut user_story, &mut criteria);
    Ok(requirements)
}

/// Parses `design.md` for `Property <N>:` blocks.
pub fn parse_properties(markdown: &str) -> Result<Vec<Property>, ParseError> {
    let mut properties = Vec::new();
    let mut current: Option<(u32, String)> = None;
    let mut statement_lines: Vec<String> = Vec::new();
    let mut requirement_refs: Vec<String> = Vec::new();

    let flush = |properties: &mut Vec<Property>,
                 current: &mut Option<(u32, String)>,
                 statement_lines: &mut Vec<String>,
                 requirement_refs: &mut Vec<String>| {
        if let Some((number, title)) = current.take() {
            properties.push(Property {
                number,
                title,
                statement: std::mem::take(statement_lines).join(" ").trim().to_string(),
                requirement_refs: std::mem::take(requirement_refs),
            });
        }
    };

    for line in markdown.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(caps) = PROPERTY_HEADER_RE.captures(line) {
            flush(&mut properties, &mut current, &mut statement_lines, &mut requirement_refs);
            let number: u32 = caps["num"].parse().map_err(|_| ParseError::Malformed {
                file: "design.md".to_string(),
                line: 0,
                message: format!("invalid property number in '{line}'"),
            })?;
            current = Some((number, caps["title"].trim().to_string()));
            continue;
        }

        if current.is_none() {
            continue;
        }

        if SECTION_HEADER_RE.is_match(line) {
            flush(&mut properties, &mut current, &mut statement_lines, &mut requirement_refs);
            continue;
        }

        if let Some(caps) = VALIDATES_LINE_RE.captures(line) {
            requirement_refs.extend(split_ids(&caps["ids"]));
            continue;
        }

        let trimmed = line.trim();
        if !trimmed.is_empty() {
            statement_lines.push(trimmed.to_string());
        }
    }

    flush(&mut properties, &mut current, &mut statement_lines, &mut requirement_refs);
    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    #[test]
    fn parses_flat_tasks() {
        let md = "- [ ] 1 Do a thing\n- [x] 2 Do another\n";
        let tasks = parse_tasks(md).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "1");
        assert_eq!(tasks[0].status, TaskStatus::NotStarted);
        assert_eq!(tasks[1].status, TaskStatus::Completed);
    }

    #[test]
    fn parses_hierarchy_by_indentation() {
        let md = "- [ ] 1 Parent\n  - [ ] 1.1 Child\n  - [ ] 1.2 Child2\n- [ ] 2 Sibling\n";
        let tasks = parse_tasks(md).unwrap();
        let parent = tasks.iter().find(|t| t.id == "1").unwrap();
        assert_eq!(parent.children, vec!["1.1".to_string(), "1.2".to_string()]);
        let child = tasks.iter().find(|t| t.id == "1.1").unwrap();
        assert_eq!(child.parent.as_deref(), Some("1"));
        let sibling = tasks.iter().find(|t| t.id == "2").unwrap();
        assert!(sibling.parent.is_none());
    }

    #[test]
    fn parses_optional_flag() {
        let md = "- [ ]* 1.2 Optional task\n";
        let tasks = parse_tasks(md).unwrap();
        assert!(tasks[0].optional);
    }

    #[test]
    fn normalizes_trailing_period_id() {
        let md = "- [x] 1. Root task\n";
        let tasks = parse_tasks(md).unwrap();
        assert_eq!(tasks[0].id, "1");
    }

    #[test]
    fn extracts_requirement_and_property_refs() {
        let md = "- [ ] 3.1 Write test _Requirements: 1.1, 2.2_ _Validates: Requirements 5_\n";
        let tasks = parse_tasks(md).unwrap();
        assert_eq!(tasks[0].requirement_refs, vec!["1.1".to_string(), "2.2".to_string()]);
        assert_eq!(tasks[0].property_refs, vec!["5".to_string()]);
    }

    #[test]
    fn s5_scenario_id_boundary_not_confused() {
        let md = "- [ ] 2.10 X\n- [ ] 2 Y\n";
        let tasks = parse_tasks(md).unwrap();
        assert_eq!(tasks[0].id, "2.10");
        assert_eq!(tasks[1].id, "2");
    }

    #[test]
    fn narrative_lines_are_skipped_not_errors() {
        let md = "# Tasks\n\nSome narrative text about the plan.\n\n- [ ] 1 Real task\n";
        let tasks = parse_tasks(md).unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn parses_requirements_sections() {
        let md = "### Requirement 1\n\n**User Story:** As a user, I want X, so that Y.\n\n#### Acceptance Criteria\n\n1. The system shall do A\n2. The system shall do B\n";
        let reqs = parse_requirements(md).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].id, "1");
        assert!(reqs[0].user_story.contains("As a user"));
        assert_eq!(reqs[0].acceptance_criteria.len(), 2);
    }

    #[test]
    fn parses_property_blocks() {
        let md = "### Property 5: Idempotent Retries\n\nRetrying an operation twice has the same\neffect as retrying it once.\n\nValidates: Requirements 1.1, 2.3\n\n### Property 6: Something Else\n\nBody.\n";
        let props = parse_properties(md).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].number, 5);
        assert_eq!(props[0].title, "Idempotent Retries");
        assert!(props[0].statement.contains("Retrying an operation"));
        assert_eq!(props[0].requirement_refs, vec!["1.1".to_string(), "2.3".to_string()]);
    }

    #[test]
    fn missing_file_is_a_structured_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = parse_spec_dir(dir.path(), "demo").unwrap_err();
        assert!(matches!(err, ParseError::MissingFile { .. }));
    }

    #[test]
    fn p1_task_id_set_equals_source_ids() {
        let md = "- [ ] 1 A\n- [ ] 1.1 B\n- [ ] 2 C\n";
        let tasks = parse_tasks(md).unwrap();
        let ids: std::collections::BTreeSet<_> = tasks.iter().map(|t| t.id.clone()).collect();
        assert_eq!(
            ids,
            ["1", "1.1", "2"].into_iter().map(String::from).collect()
        );
    }
}
