//! Subprocess invocation of the external test tool and structured parsing
//! of its output.
//!
//! The timeout-then-kill subprocess lifecycle mirrors the loop runner's
//! graceful-SIGTERM-then-SIGKILL pattern elsewhere in this codebase:
//! terminate the whole process group first, give it a short grace window,
//! then kill it outright.

use crate::error::TestRunnerError;
use regex::Regex;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

static PROPERTY_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Property\s+(\d+)").unwrap());
static REQUIREMENTS_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Requirements?\s+([\d.,\s]+)").unwrap());
static ITERATIONS_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:times|numRuns|iterations|cases)\s*[:(]\s*(\d+)").unwrap()
});

/// A single failing test extracted from the tool's output.
#[derive(Debug, Clone, Default)]
pub struct TestFailure {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub property_tag: Option<u32>,
    pub requirement_tags: Vec<String>,
}

/// Structured outcome of one test-runner invocation.
#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub duration_ms: u64,
    pub failures: Vec<TestFailure>,
}

impl TestResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.total > 0
    }
}

#[derive(Debug, Deserialize)]
struct JsonReport {
    #[serde(rename = "numTotalTests", default)]
    num_total_tests: u32,
    #[serde(rename = "numPassedTests", default)]
    num_passed_tests: u32,
    #[serde(rename = "numFailedTests", default)]
    num_failed_tests: u32,
    #[serde(rename = "testResults", default)]
    test_results: Vec<JsonSuiteResult>,
}

#[derive(Debug, Deserialize)]
struct JsonSuiteResult {
    #[serde(rename = "assertionResults", default)]
    assertion_results: Vec<JsonAssertionResult>,
}

#[derive(Debug, Deserialize)]
struct JsonAssertionResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(rename = "failureMessages", default)]
    failure_messages: Vec<String>,
}

/// Runs the test command as a child process with a timeout. Captures
/// stdout/stderr in full, then parses the combined output (JSON reporter
/// first, falling back to text scanning).
pub fn run_tests(
    command: &[String],
    timeout: Duration,
    kill_grace: Duration,
) -> Result<TestResult, TestRunnerError> {
    let Some((program, args)) = command.split_first() else {
        return Err(TestRunnerError::UnparseableOutput {
            message: "empty test command".to_string(),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|source| TestRunnerError::Spawn {
        command: command.join(" "),
        source,
    })?;

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if started.elapsed() >= timeout {
                    break None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => break None,
        }
    };

    if status.is_none() {
        terminate_timed_out(&mut child, kill_grace);
        return Err(TestRunnerError::Timeout {
            timeout_secs: timeout.as_secs(),
        });
    }

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }
    let duration_ms = started.elapsed().as_millis() as u64;

    let combined = format!("{stdout}\n{stderr}");
    let mut result = parse_json_report(&stdout)
        .or_else(|| parse_text_report(&combined))
        .ok_or_else(|| TestRunnerError::UnparseableOutput {
            message: "output was neither valid JSON reporter output nor recognizable text"
                .to_string(),
        })?;
    result.duration_ms = duration_ms;
    Ok(result)
}

#[cfg(unix)]
fn terminate_timed_out(child: &mut std::process::Child, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    let _ = killpg(pgid, Signal::SIGTERM);
    std::thread::sleep(grace);
    if child.try_wait().ok().flatten().is_none() {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate_timed_out(child: &mut std::process::Child, _grace: Duration) {
    let _ = child.kill();
    let _ = child.wait();
}

fn parse_json_report(stdout: &str) -> Option<TestResult> {
    let json_start = stdout.find('{')?;
    let report: JsonReport = serde_json::from_str(&stdout[json_start..]).ok()?;

    let mut failures = Vec::new();
    for suite in &report.test_results {
        for assertion in &suite.assertion_results {
            if assertion.status != "failed" {
                continue;
            }
            let message = assertion.failure_messages.join("\n");
            failures.push(extract_failure(&assertion.title, &message));
        }
    }

    Some(TestResult {
        total: report.num_total_tests,
        passed: report.num_passed_tests,
        failed: report.num_failed_tests,
        duration_ms: 0,
        failures,
    })
}

static TEXT_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Tests?:\s*(?:(\d+)\s*failed,?\s*)?(?:(\d+)\s*passed,?\s*)?(\d+)\s*total").unwrap()
});
static TEXT_FAILURE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:FAIL|✗|✕|×)\s+(.+)$").unwrap());

fn parse_text_report(output: &str) -> Option<TestResult> {
    let caps = TEXT_SUMMARY_RE.captures(output)?;
    let failed: u32 = caps.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let passed: u32 = caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    let total: u32 = caps[3].parse().ok()?;

    let mut failures = Vec::new();
    let mut lines = output.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(header) = TEXT_FAILURE_HEADER_RE.captures(line) {
            let mut message_lines = Vec::new();
            while let Some(next) = lines.peek() {
                if TEXT_FAILURE_HEADER_RE.is_match(next) || TEXT_SUMMARY_RE.is_match(next) {
                    break;
                }
                message_lines.push(lines.next().unwrap().trim().to_string());
                if message_lines.len() >= 20 {
                    break;
                }
            }
            let message = message_lines.join("\n");
            failures.push(extract_failure(&header[1], &message));
        }
    }

    Some(TestResult {
        total,
        passed,
        failed,
        duration_ms: 0,
        failures,
    })
}

fn extract_failure(title: &str, message: &str) -> TestFailure {
    let combined = format!("{title}\n{message}");
    let property_tag = PROPERTY_TAG_RE
        .captures(&combined)
        .and_then(|c| c[1].parse().ok());
    let requirement_tags = REQUIREMENTS_TAG_RE
        .captures(&combined)
        .map(|c| {
            c[1].split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let (message_text, stack) = split_message_and_stack(message);

    TestFailure {
        name: title.to_string(),
        message: message_text,
        stack,
        property_tag,
        requirement_tags,
    }
}

fn split_message_and_stack(message: &str) -> (String, Option<String>) {
    if let Some(idx) = message.find("\n    at ") {
        let (head, tail) = message.split_at(idx);
        (head.trim().to_string(), Some(tail.trim().to_string()))
    } else {
        (message.trim().to_string(), None)
    }
}

/// Scans `source` for property-test iteration configuration and warns if
/// a configured call declares fewer than `min_iterations`. Heuristic by
/// nature (Q3): returns no warning when no matching call is found rather
/// than guessing a violation.
pub fn check_property_iterations(source: &str, min_iterations: u32) -> Vec<String> {
    let mut warnings = Vec::new();
    for caps in ITERATIONS_CALL_RE.captures_iter(source) {
        if let Ok(n) = caps[1].parse::<u32>() {
            if n < min_iterations {
                warnings.push(format!(
                    "property test configures {n} iterations, below the minimum of {min_iterations}"
                ));
            }
        }
    }
    warnings
}

/// Maps a changed source file to the test files that conventionally
/// exercise it: sibling `<base>.test.<ext>` / `<base>.spec.<ext>`, and any
/// matching file under `tests/unit`, `tests/integration`, or
/// `tests/properties` relative to `project_root`.
pub fn test_files_for(changed_file: &Path, project_root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Some(stem) = changed_file.file_stem().map(|s| s.to_string_lossy().to_string()) else {
        return found;
    };
    let ext = changed_file.extension().map(|e| e.to_string_lossy().to_string());
    let parent = changed_file.parent().unwrap_or_else(|| Path::new("."));

    if let Some(ext) = &ext {
        for suffix in ["test", "spec"] {
            let candidate = parent.join(format!("{stem}.{suffix}.{ext}"));
            if candidate.exists() {
                found.push(candidate);
            }
        }

        for subdir in ["tests/unit", "tests/integration", "tests/properties"] {
            let dir = project_root.join(subdir);
            if !dir.is_dir() {
                continue;
            }
            for name in [format!("{stem}.test.{ext}"), format!("{stem}.spec.{ext}"), format!("{stem}.{ext}")] {
                let candidate = dir.join(&name);
                if candidate.exists() {
                    found.push(candidate);
                }
            }
        }
    }

    found.sort();
    found.dedup();
    found
}
