//! Matrix enumeration, per-cell sequencing, and the deploy barrier.
//!
//! Each cell runs the same sequence: ensure both native builds, compose
//! the cell's environment, run the installation pipeline, run both test
//! partitions. Cells never share state except the artifact cache, and a
//! failing cell never stops its siblings. Only after every cell has
//! reported does the deployment gate evaluate.

use chrono::{DateTime, Utc};

use crate::cache::ArtifactCache;
use crate::config::GantryConfig;
use crate::deploy::{
    DeployDecision, DeploymentGate, DocsPublisher, Secret, execute_deploy,
};
use crate::environment::{Environment, InstallRoots, compose};
use crate::error::GantryError;
use crate::native::{BuildCoordinator, NativeBuilder};
use crate::pipeline::Pipeline;
use crate::testing::{TestExecutor, TestReport, TestRunner};
use crate::types::{Library, MatrixCell};

/// What happened to one cell.
#[derive(Debug)]
pub enum CellOutcome {
    /// Pipeline ran to completion; partition reports were collected. The
    /// cell may still have failing tests or unreportable partitions.
    Completed {
        completed_steps: Vec<&'static str>,
        reports: Vec<TestReport>,
        partition_errors: Vec<GantryError>,
    },
    /// Provisioning or installation aborted the cell before any test could
    /// report.
    Aborted(GantryError),
}

impl CellOutcome {
    pub fn passed(&self) -> bool {
        match self {
            CellOutcome::Completed {
                reports,
                partition_errors,
                ..
            } => {
                partition_errors.is_empty()
                    && reports.len() == crate::testing::Partition::ALL.len()
                    && reports.iter().all(TestReport::all_green)
            }
            CellOutcome::Aborted(_) => false,
        }
    }
}

/// One row of the matrix result.
#[derive(Debug)]
pub struct CellReport {
    pub cell: MatrixCell,
    pub outcome: CellOutcome,
}

/// Aggregated results for the whole matrix. Complete by construction:
/// the orchestrator only builds it after every cell has reported, which is
/// the barrier the deployment gate relies on.
#[derive(Debug)]
pub struct MatrixResult {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    cells: Vec<CellReport>,
}

impl MatrixResult {
    pub fn new(
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        cells: Vec<CellReport>,
    ) -> Self {
        Self {
            started_at,
            finished_at,
            cells,
        }
    }

    pub fn cells(&self) -> &[CellReport] {
        &self.cells
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn all_passed(&self) -> bool {
        self.cells.iter().all(|report| report.outcome.passed())
    }

    pub fn failed_cells(&self) -> impl Iterator<Item = &CellReport> {
        self.cells.iter().filter(|report| !report.outcome.passed())
    }
}

/// Final status of a run, mapped onto the process exit code so operators
/// can tell "a cell failed" from "deploy failed after a green matrix".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Passed,
    CellsFailed,
    DeployFailed,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Passed => 0,
            RunStatus::CellsFailed => 1,
            RunStatus::DeployFailed => 2,
        }
    }
}

/// Everything a full run produces.
#[derive(Debug)]
pub struct RunSummary {
    pub result: MatrixResult,
    pub decision: DeployDecision,
    pub deploy_failures: Vec<GantryError>,
}

impl RunSummary {
    pub fn status(&self) -> RunStatus {
        if !self.result.all_passed() {
            RunStatus::CellsFailed
        } else if !self.deploy_failures.is_empty() {
            RunStatus::DeployFailed
        } else {
            RunStatus::Passed
        }
    }
}

/// Per-run inputs that are not part of the static configuration.
#[derive(Debug)]
pub struct RunOptions {
    /// Current branch, evaluated against the deploy target.
    pub branch: String,
    /// Instrument the fast partition with coverage.
    pub coverage: bool,
    /// Publish credential; absent outside deploy-capable contexts.
    pub credential: Option<Secret>,
}

/// Composition root for one matrix run. Collaborators are injected so the
/// orchestrator's own tests run with fakes: canned install roots, recorded
/// environments, scripted partition reports.
pub struct Orchestrator<'a> {
    config: &'a GantryConfig,
    cache: &'a ArtifactCache,
    builder: &'a dyn NativeBuilder,
    pipeline: &'a dyn Pipeline,
    runner: &'a dyn TestRunner,
    publisher: &'a dyn DocsPublisher,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a GantryConfig,
        cache: &'a ArtifactCache,
        builder: &'a dyn NativeBuilder,
        pipeline: &'a dyn Pipeline,
        runner: &'a dyn TestRunner,
        publisher: &'a dyn DocsPublisher,
    ) -> Self {
        Self {
            config,
            cache,
            builder,
            pipeline,
            runner,
            publisher,
        }
    }

    /// Run every declared cell, then evaluate the gate exactly once.
    ///
    /// Returns `Err` only for run-fatal failures (cache corruption); every
    /// cell-local failure is recorded in the summary instead.
    pub fn run(&self, opts: &RunOptions) -> Result<RunSummary, GantryError> {
        let started_at = Utc::now();
        let mut cells = Vec::with_capacity(self.config.matrix.len());

        for cell in &self.config.matrix {
            let outcome = match self.run_cell(cell, opts) {
                Ok(outcome) => outcome,
                Err(err) if err.is_run_fatal() => return Err(err),
                Err(err) => CellOutcome::Aborted(err),
            };
            if !outcome.passed() {
                tracing::warn!(cell = %cell, "cell did not pass");
            }
            cells.push(CellReport {
                cell: cell.clone(),
                outcome,
            });
        }

        let result = MatrixResult::new(started_at, Utc::now(), cells);

        // Every cell has reported; the gate may now evaluate.
        let mut gate = DeploymentGate::new(self.config.deploy.clone());
        let decision = gate.evaluate(&result, &opts.branch);

        let mut deploy_failures = Vec::new();
        if let DeployDecision::Deploying { cells } = &decision {
            for cell in cells {
                if let Err(err) = self.deploy_cell(cell, opts) {
                    tracing::error!(cell = %cell, error = %err, "deploy attempt failed");
                    deploy_failures.push(err);
                }
            }
        }

        Ok(RunSummary {
            result,
            decision,
            deploy_failures,
        })
    }

    fn run_cell(&self, cell: &MatrixCell, opts: &RunOptions) -> Result<CellOutcome, GantryError> {
        tracing::info!(cell = %cell, "starting matrix cell");
        let env = match self.provision(cell) {
            Ok(env) => env,
            // Cache corruption propagates; anything else aborts this cell only.
            Err(err) if err.is_run_fatal() => return Err(err),
            Err(err) => return Ok(CellOutcome::Aborted(err)),
        };

        let state = match self.pipeline.run(&env, cell) {
            Ok(state) => state,
            Err(err) => return Ok(CellOutcome::Aborted(err)),
        };

        let executor = TestExecutor::new(self.runner, opts.coverage);
        let (reports, partition_errors) = executor.run_all(&env, cell);
        Ok(CellOutcome::Completed {
            completed_steps: state.completed().to_vec(),
            reports,
            partition_errors,
        })
    }

    /// Ensure both native builds and compose the cell's environment.
    /// PROJ first: the GDAL build links against it.
    fn provision(&self, cell: &MatrixCell) -> Result<Environment, GantryError> {
        let coordinator = BuildCoordinator::new(self.cache, self.builder);
        let proj = coordinator.ensure(Library::Proj, &cell.proj)?;
        let gdal = coordinator.ensure(Library::Gdal, &cell.gdal)?;
        Ok(compose(&InstallRoots {
            gdal: gdal.install_root,
            proj: proj.install_root,
        }))
    }

    fn deploy_cell(&self, cell: &MatrixCell, opts: &RunOptions) -> Result<(), GantryError> {
        let Some(credential) = &opts.credential else {
            return Err(GantryError::DeployFailure {
                stage: crate::error::DeployStage::Publish,
                cause: anyhow::anyhow!("No publish credential supplied"),
            });
        };
        // Both builds are cache hits at this point.
        let env = self.provision(cell)?;
        execute_deploy(self.publisher, &env, cell, credential)
    }
}
