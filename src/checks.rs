//! Post-apply checks
//!
//! Runs a small set of fast, local checks after quill applies edits. The
//! goal is a clear failure report the repair loop can feed back to the
//! model, not exhaustive CI.

use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    /// Combined stdout/stderr (truncated)
    pub output: String,
}

impl CheckResult {
    pub fn failed(&self) -> bool {
        self.status == CheckStatus::Fail
    }
}

/// Run a pragmatic set of checks for the repo.
///
/// Always includes `git diff --check`.
/// Adds language-specific checks when the toolchain is detected.
pub fn run(repo_path: &Path) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(run_cmd(repo_path, "git diff --check", "git", &["diff", "--check"]));

    if repo_path.join("Cargo.toml").exists() {
        results.push(run_cmd(repo_path, "cargo check", "cargo", &["check", "-q"]));
    }

    if repo_path.join("go.mod").exists() {
        results.push(run_cmd(repo_path, "go vet ./...", "go", &["vet", "./..."]));
    }

    if repo_path.join("pyproject.toml").exists() || repo_path.join("setup.py").exists() {
        results.push(run_cmd(
            repo_path,
            "python -m compileall .",
            "python",
            &["-m", "compileall", "-q", "."],
        ));
    }

    results
}

/// Failure output formatted for a corrective message, or None when every
/// check passed or was skipped.
pub fn failure_report(results: &[CheckResult]) -> Option<String> {
    let failures: Vec<&CheckResult> = results.iter().filter(|r| r.failed()).collect();
    if failures.is_empty() {
        return None;
    }
    let mut report = String::from("The following checks failed after your edits:\n");
    for failure in failures {
        report.push_str(&format!("\n{}:\n{}\n", failure.name, failure.output));
    }
    report.push_str("\nPlease fix the problems with further edits.");
    Some(report)
}

fn run_cmd(repo_path: &Path, name: &str, bin: &str, args: &[&str]) -> CheckResult {
    let output = Command::new(bin).current_dir(repo_path).args(args).output();

    match output {
        Ok(out) => {
            let mut combined = String::new();
            if !out.stdout.is_empty() {
                combined.push_str(&String::from_utf8_lossy(&out.stdout));
            }
            if !out.stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
            }

            let status = if out.status.success() {
                CheckStatus::Pass
            } else {
                CheckStatus::Fail
            };

            CheckResult {
                name: name.to_string(),
                status,
                output: truncate_output(&combined, 1800),
            }
        }
        Err(e) => CheckResult {
            name: name.to_string(),
            status: CheckStatus::Skipped,
            output: format!("Skipped: {}", e),
        },
    }
}

fn truncate_output(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let char_count = trimmed.chars().count();
    if char_count <= max {
        trimmed.to_string()
    } else {
        let snippet: String = trimmed.chars().take(max).collect();
        format!("{}\n… (truncated)", snippet)
    }
}
