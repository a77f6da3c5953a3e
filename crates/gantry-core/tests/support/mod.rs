//! Shared fakes for orchestrator-level tests. Builds, pipelines, test
//! runs, and publishing are all canned so no native compile, pip, or
//! pytest ever runs inside this suite.

#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use semver::Version;

use gantry_core::environment::Environment;
use gantry_core::error::GantryError;
use gantry_core::pipeline::{Pipeline, PipelineState};
use gantry_core::prelude::*;
use gantry_core::testing::Partition;

pub fn version(s: &str) -> Version {
    Version::parse(s).expect("valid version in test")
}

pub fn cell(python: &str, gdal: &str, proj: &str) -> MatrixCell {
    MatrixCell::new(python, version(gdal), version(proj))
}

/// Config with the two-cell matrix used by most scenarios:
/// (3.6, gdal 3.0.2, proj 6.1.1) and (3.8, gdal 3.0.4, proj 6.1.1),
/// deploy target (master, 3.8).
pub fn two_cell_config(cache_dir: &Path) -> GantryConfig {
    let mut config = minimal_config(cache_dir);
    config.matrix = vec![
        cell("3.6", "3.0.2", "6.1.1"),
        cell("3.8", "3.0.4", "6.1.1"),
    ];
    config.deploy = Some(DeployTarget::new("master", "3.8"));
    config
}

pub fn minimal_config(cache_dir: &Path) -> GantryConfig {
    let mut config: GantryConfig =
        toml::from_str("").expect("empty config should deserialize with defaults");
    config.cache_dir = Some(cache_dir.to_path_buf());
    config
}

/// Builder that writes a canned install tree instantly and counts
/// invocations per key.
#[derive(Debug, Default)]
pub struct FakeBuilder {
    builds: Mutex<Vec<String>>,
    failing: HashSet<String>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make builds for `library-version` fail.
    pub fn failing(mut self, library: Library, version_str: &str) -> Self {
        self.failing.insert(format!("{library}-{version_str}"));
        self
    }

    pub fn build_count(&self, library: Library, version_str: &str) -> usize {
        let key = format!("{library}-{version_str}");
        self.builds
            .lock()
            .expect("builds lock poisoned")
            .iter()
            .filter(|recorded| **recorded == key)
            .count()
    }

    pub fn total_builds(&self) -> usize {
        self.builds.lock().expect("builds lock poisoned").len()
    }
}

impl NativeBuilder for FakeBuilder {
    fn build(
        &self,
        library: Library,
        version: &Version,
        target_root: &Path,
    ) -> anyhow::Result<()> {
        let key = format!("{library}-{version}");
        self.builds
            .lock()
            .expect("builds lock poisoned")
            .push(key.clone());
        if self.failing.contains(&key) {
            anyhow::bail!("canned build failure for {key}");
        }
        for subdir in ["bin", "lib", "include"] {
            fs::create_dir_all(target_root.join(subdir))?;
        }
        let share = target_root.join("share").join(library.as_str());
        fs::create_dir_all(&share)?;
        fs::write(share.join("VERSION"), version.to_string())?;
        fs::write(target_root.join("lib").join("marker.so"), key)?;
        Ok(())
    }
}

/// Pipeline fake recording the environment each cell was handed.
#[derive(Debug, Default)]
pub struct FakePipeline {
    runs: Mutex<Vec<(String, Environment)>>,
    failing_cells: HashSet<String>,
}

impl FakePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the pipeline for a given cell label.
    pub fn failing(mut self, cell_label: &str) -> Self {
        self.failing_cells.insert(cell_label.to_string());
        self
    }

    pub fn runs(&self) -> Vec<(String, Environment)> {
        self.runs.lock().expect("runs lock poisoned").clone()
    }

    pub fn env_for(&self, cell_label: &str) -> Option<Environment> {
        self.runs()
            .into_iter()
            .find(|(label, _)| label == cell_label)
            .map(|(_, env)| env)
    }
}

impl Pipeline for FakePipeline {
    fn run(&self, env: &Environment, cell: &MatrixCell) -> Result<PipelineState, GantryError> {
        self.runs
            .lock()
            .expect("runs lock poisoned")
            .push((cell.label(), env.clone()));
        if self.failing_cells.contains(&cell.label()) {
            return Err(GantryError::InstallStepFailure {
                step: 5,
                name: "install-binding",
                cell: cell.label(),
                completed: vec![
                    "upgrade-pip",
                    "install-build-helper",
                    "strip-pinned-binding",
                    "install-requirements",
                ],
                cause: anyhow::anyhow!("canned pipeline failure"),
            });
        }
        Ok(PipelineState::default())
    }
}

/// Runner returning canned reports; specific (cell label, partition)
/// combinations can be scripted to fail or to error out entirely.
#[derive(Debug, Default)]
pub struct FakeRunner {
    invocations: Mutex<Vec<(String, Partition, bool)>>,
    failing: HashSet<(String, Partition)>,
    erroring: HashSet<(String, Partition)>,
}

impl FakeRunner {
    pub fn all_green() -> Self {
        Self::default()
    }

    /// Report one failed test for this cell/partition.
    pub fn failing(mut self, cell_label: &str, partition: Partition) -> Self {
        self.failing.insert((cell_label.to_string(), partition));
        self
    }

    /// Make the runner invocation itself error for this cell/partition.
    pub fn erroring(mut self, cell_label: &str, partition: Partition) -> Self {
        self.erroring.insert((cell_label.to_string(), partition));
        self
    }

    pub fn invocations(&self) -> Vec<(String, Partition, bool)> {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .clone()
    }
}

impl TestRunner for FakeRunner {
    fn run(
        &self,
        _env: &Environment,
        cell: &MatrixCell,
        partition: Partition,
        coverage: bool,
    ) -> anyhow::Result<TestReport> {
        self.invocations
            .lock()
            .expect("invocations lock poisoned")
            .push((cell.label(), partition, coverage));
        let key = (cell.label(), partition);
        if self.erroring.contains(&key) {
            anyhow::bail!("canned runner error");
        }
        let failed = u32::from(self.failing.contains(&key));
        Ok(TestReport {
            partition,
            passed: 10 - failed,
            failed,
            skipped: 1,
            coverage: coverage.then(|| "85%".to_string()),
        })
    }
}

/// Publisher recording build/publish calls per cell.
#[derive(Debug, Default)]
pub struct FakePublisher {
    built: Mutex<Vec<String>>,
    published: Mutex<Vec<String>>,
    fail_publish: bool,
}

impl FakePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_publish() -> Self {
        Self {
            fail_publish: true,
            ..Self::default()
        }
    }

    pub fn built(&self) -> Vec<String> {
        self.built.lock().expect("built lock poisoned").clone()
    }

    pub fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .expect("published lock poisoned")
            .clone()
    }
}

impl DocsPublisher for FakePublisher {
    fn build(&self, _env: &Environment, cell: &MatrixCell) -> anyhow::Result<PathBuf> {
        self.built
            .lock()
            .expect("built lock poisoned")
            .push(cell.label());
        Ok(PathBuf::from("/tmp/docs/_build/html"))
    }

    fn publish(&self, _docs: &Path, _credential: &Secret) -> anyhow::Result<()> {
        if self.fail_publish {
            anyhow::bail!("canned publish failure");
        }
        // The fake never records the credential, mirroring the contract
        // that the token is consumed by the transport and nothing else.
        self.published
            .lock()
            .expect("published lock poisoned")
            .push("publish".to_string());
        Ok(())
    }
}

/// Completed-cell report with all-green partitions, for gate-level tests.
pub fn green_report(cell: &MatrixCell) -> CellReport {
    CellReport {
        cell: cell.clone(),
        outcome: CellOutcome::Completed {
            completed_steps: vec![],
            reports: vec![
                TestReport {
                    partition: Partition::Slow,
                    passed: 5,
                    failed: 0,
                    skipped: 0,
                    coverage: None,
                },
                TestReport {
                    partition: Partition::Fast,
                    passed: 40,
                    failed: 0,
                    skipped: 2,
                    coverage: None,
                },
            ],
            partition_errors: vec![],
        },
    }
}

/// Completed-cell report with a failing slow partition.
pub fn slow_failure_report(cell: &MatrixCell) -> CellReport {
    CellReport {
        cell: cell.clone(),
        outcome: CellOutcome::Completed {
            completed_steps: vec![],
            reports: vec![
                TestReport {
                    partition: Partition::Slow,
                    passed: 4,
                    failed: 1,
                    skipped: 0,
                    coverage: None,
                },
                TestReport {
                    partition: Partition::Fast,
                    passed: 40,
                    failed: 0,
                    skipped: 2,
                    coverage: None,
                },
            ],
            partition_errors: vec![],
        },
    }
}

pub fn matrix_result(cells: Vec<CellReport>) -> MatrixResult {
    let now = chrono::Utc::now();
    MatrixResult::new(now, now, cells)
}
