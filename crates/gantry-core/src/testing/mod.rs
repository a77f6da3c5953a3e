//! Partitioned pytest execution.
//!
//! The suite runs twice per cell, split on the `slow` marker. Both
//! partitions always run: a failing slow partition still leaves the fast
//! partition's signal on the record. Coverage, when requested, instruments
//! the fast partition only and never fails a run by itself.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::environment::Environment;
use crate::error::GantryError;
use crate::pipeline::python_executable;
use crate::types::MatrixCell;

/// The two marker-selected halves of the suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Slow,
    Fast,
}

impl Partition {
    /// Slow first: the long numeric runs surface environment problems
    /// before the cheap half spends time on them.
    pub const ALL: [Partition; 2] = [Partition::Slow, Partition::Fast];

    /// Marker expression handed to `pytest -m`.
    pub fn marker_expr(&self) -> &'static str {
        match self {
            Partition::Slow => "slow",
            Partition::Fast => "not slow",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Partition::Slow => "slow",
            Partition::Fast => "fast",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured result of one partition run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub partition: Partition,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    /// Total coverage percentage, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<String>,
}

impl TestReport {
    pub fn all_green(&self) -> bool {
        self.failed == 0
    }
}

/// Test runner invocation surface, injected so orchestrator tests use
/// canned reports instead of a live interpreter.
pub trait TestRunner {
    fn run(
        &self,
        env: &Environment,
        cell: &MatrixCell,
        partition: Partition,
        coverage: bool,
    ) -> anyhow::Result<TestReport>;
}

/// Production runner shelling out to `pythonX.Y -m pytest`.
#[derive(Debug)]
pub struct PytestRunner {
    package_root: PathBuf,
    coverage_config: Option<PathBuf>,
}

impl PytestRunner {
    pub fn new(package_root: PathBuf, coverage_config: Option<PathBuf>) -> Self {
        Self {
            package_root,
            coverage_config,
        }
    }
}

impl TestRunner for PytestRunner {
    fn run(
        &self,
        env: &Environment,
        cell: &MatrixCell,
        partition: Partition,
        coverage: bool,
    ) -> anyhow::Result<TestReport> {
        let python = python_executable(&cell.python);
        let mut cmd = Command::new(&python);
        cmd.args(["-m", "pytest", "tests", "-m", partition.marker_expr()])
            .current_dir(&self.package_root);
        if coverage {
            cmd.arg("--cov");
            if let Some(config) = &self.coverage_config {
                cmd.arg(format!("--cov-config={}", config.display()));
            }
        }
        env.apply_to(&mut cmd);

        tracing::info!(cell = %cell, partition = %partition, coverage, "running test partition");
        let output = cmd
            .output()
            .with_context(|| format!("Failed to invoke {} -m pytest", python))?;

        // Exit code 1 means test failures, which the summary accounts for.
        // Anything above 1 is a usage or internal error with no usable counts.
        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if code > 1 || code < 0 {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "pytest exited with {} before producing results: {}",
                output.status,
                stderr.trim_end()
            );
        }

        let (passed, failed, skipped) = parse_summary(&stdout)
            .ok_or_else(|| anyhow::anyhow!("No pytest summary line in output"))?;
        Ok(TestReport {
            partition,
            passed,
            failed,
            skipped,
            coverage: if coverage {
                parse_coverage_total(&stdout)
            } else {
                None
            },
        })
    }
}

/// Parse the trailing pytest summary line, e.g.
/// `===== 12 passed, 2 failed, 3 skipped in 42.01s =====`.
///
/// Returns (passed, failed, skipped). `error`/`errors` tokens count as
/// failures so a collection error is never mistaken for a green partition.
pub fn parse_summary(output: &str) -> Option<(u32, u32, u32)> {
    for line in output.lines().rev() {
        let line = line.trim().trim_matches('=').trim();
        if !line.contains(" in ") && !line.contains("no tests ran") {
            continue;
        }

        let mut passed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut matched = false;
        let counts = line.split(" in ").next().unwrap_or(line);
        for part in counts.split(',') {
            let mut words = part.split_whitespace();
            let (Some(count), Some(label)) = (words.next(), words.next()) else {
                continue;
            };
            let Ok(count) = count.parse::<u32>() else {
                continue;
            };
            match label {
                "passed" => {
                    passed = count;
                    matched = true;
                }
                "failed" => {
                    failed = count;
                    matched = true;
                }
                "skipped" => {
                    skipped = count;
                    matched = true;
                }
                "error" | "errors" => {
                    failed += count;
                    matched = true;
                }
                _ => {}
            }
        }
        if matched || line.contains("no tests ran") {
            return Some((passed, failed, skipped));
        }
    }
    None
}

/// Total percentage from the coverage table's `TOTAL` row, if present.
fn parse_coverage_total(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with("TOTAL"))
        .and_then(|line| line.split_whitespace().last())
        .filter(|token| token.ends_with('%'))
        .map(str::to_string)
}

/// Runs both partitions for a cell, converting runner invocation errors
/// into recorded [`GantryError::TestPartitionFailure`]s without skipping
/// the remaining partition.
pub struct TestExecutor<'a> {
    runner: &'a dyn TestRunner,
    coverage: bool,
}

impl<'a> TestExecutor<'a> {
    pub fn new(runner: &'a dyn TestRunner, coverage: bool) -> Self {
        Self { runner, coverage }
    }

    pub fn run_all(
        &self,
        env: &Environment,
        cell: &MatrixCell,
    ) -> (Vec<TestReport>, Vec<GantryError>) {
        let mut reports = Vec::new();
        let mut errors = Vec::new();
        for partition in Partition::ALL {
            let coverage = self.coverage && partition == Partition::Fast;
            match self.runner.run(env, cell, partition, coverage) {
                Ok(report) => reports.push(report),
                Err(cause) => errors.push(GantryError::TestPartitionFailure { partition, cause }),
            }
        }
        (reports, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary_full_line() {
        let output = "\
collected 17 items

tests/test_timeseries.py ............F....

===== 12 passed, 2 failed, 3 skipped in 42.01s =====
";
        assert_eq!(parse_summary(output), Some((12, 2, 3)));
    }

    #[test]
    fn test_parse_summary_passed_only() {
        let output = "== 101 passed in 12.34s ==";
        assert_eq!(parse_summary(output), Some((101, 0, 0)));
    }

    #[test]
    fn test_parse_summary_counts_errors_as_failures() {
        let output = "= 4 passed, 1 error in 3.21s =";
        assert_eq!(parse_summary(output), Some((4, 1, 0)));
    }

    #[test]
    fn test_parse_summary_no_tests_ran() {
        let output = "===== no tests ran in 0.12s =====";
        assert_eq!(parse_summary(output), Some((0, 0, 0)));
    }

    #[test]
    fn test_parse_summary_missing() {
        assert_eq!(parse_summary("pytest: error: unrecognized arguments"), None);
    }

    #[test]
    fn test_parse_coverage_total() {
        let output = "\
Name                 Stmts   Miss  Cover
----------------------------------------
pyrate/shared.py       220     30    86%
----------------------------------------
TOTAL                 1894    290    85%
== 50 passed in 60.00s ==
";
        assert_eq!(parse_coverage_total(output), Some("85%".to_string()));
    }

    #[test]
    fn test_partition_marker_expressions() {
        assert_eq!(Partition::Slow.marker_expr(), "slow");
        assert_eq!(Partition::Fast.marker_expr(), "not slow");
    }
}
