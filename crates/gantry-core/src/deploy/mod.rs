//! Documentation deployment gate.
//!
//! A single decision point after the whole matrix has reported: docs are
//! built and published only when every cell passed and one cell matches
//! the configured (branch, python) target. Deploy failures never reach
//! back into the already-reported test results.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;

use crate::environment::Environment;
use crate::error::{DeployStage, GantryError};
use crate::orchestrator::MatrixResult;
use crate::types::{DeployTarget, MatrixCell};

/// Gate lifecycle. `Evaluating` is only ever entered with a complete
/// [`MatrixResult`]; the orchestrator's join barrier guarantees that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Evaluating,
    Deploying,
    Skipped,
}

/// Why the gate declined to deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No deploy target configured.
    NoTarget,
    /// At least one cell failed or aborted.
    CellsFailed,
    /// All green, but no cell matches the target tuple on this branch.
    NoMatchingCell,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoTarget => f.write_str("no deploy target configured"),
            SkipReason::CellsFailed => f.write_str("matrix did not pass"),
            SkipReason::NoMatchingCell => f.write_str("no cell matches the deploy target"),
        }
    }
}

/// Outcome of the single gate evaluation, consumed exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployDecision {
    /// Every matching cell attempts deployment, in declaration order. More
    /// than one match is a configuration mistake; all of them deploy and
    /// the last write wins at the publish transport.
    Deploying { cells: Vec<MatrixCell> },
    Skipped { reason: SkipReason },
}

#[derive(Debug)]
pub struct DeploymentGate {
    target: Option<DeployTarget>,
    state: GateState,
}

impl DeploymentGate {
    pub fn new(target: Option<DeployTarget>) -> Self {
        Self {
            target,
            state: GateState::Idle,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Evaluate the structural predicate over the completed matrix.
    ///
    /// Transitions `Idle -> Evaluating -> Deploying | Skipped`.
    pub fn evaluate(&mut self, result: &MatrixResult, branch: &str) -> DeployDecision {
        self.state = GateState::Evaluating;
        let decision = match &self.target {
            None => DeployDecision::Skipped {
                reason: SkipReason::NoTarget,
            },
            Some(_) if !result.all_passed() => DeployDecision::Skipped {
                reason: SkipReason::CellsFailed,
            },
            Some(target) => {
                let cells: Vec<MatrixCell> = result
                    .cells()
                    .iter()
                    .map(|report| &report.cell)
                    .filter(|cell| target.matches(branch, cell))
                    .cloned()
                    .collect();
                if cells.is_empty() {
                    DeployDecision::Skipped {
                        reason: SkipReason::NoMatchingCell,
                    }
                } else {
                    DeployDecision::Deploying { cells }
                }
            }
        };
        self.state = match &decision {
            DeployDecision::Deploying { .. } => GateState::Deploying,
            DeployDecision::Skipped { .. } => GateState::Skipped,
        };
        tracing::info!(branch, state = ?self.state, "deployment gate evaluated");
        decision
    }
}

/// Opaque credential for the publish transport.
///
/// Debug output redacts the token; it is handed to exactly one publish
/// call and never persisted.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// External collaborators: the docs generator and the publish transport.
pub trait DocsPublisher {
    /// Build the documentation tree, returning its output directory.
    fn build(&self, env: &Environment, cell: &MatrixCell) -> anyhow::Result<PathBuf>;

    /// Push a built tree to the hosting side.
    fn publish(&self, docs: &Path, credential: &Secret) -> anyhow::Result<()>;
}

/// Sphinx build plus a publish script, the production pair.
///
/// The token travels to the script through the process environment rather
/// than argv, which is visible to every process on the host.
#[derive(Debug)]
pub struct SphinxPublisher {
    package_root: PathBuf,
    publish_script: PathBuf,
}

impl SphinxPublisher {
    pub const TOKEN_VAR: &'static str = "GANTRY_DOCS_TOKEN";

    pub fn new(package_root: PathBuf, publish_script: PathBuf) -> Self {
        Self {
            package_root,
            publish_script,
        }
    }
}

impl DocsPublisher for SphinxPublisher {
    fn build(&self, env: &Environment, cell: &MatrixCell) -> anyhow::Result<PathBuf> {
        let python = crate::pipeline::python_executable(&cell.python);
        let out_dir = self.package_root.join("docs").join("_build").join("html");
        let mut cmd = Command::new(&python);
        cmd.args(["-m", "sphinx", "-b", "html", "docs"])
            .arg(&out_dir)
            .current_dir(&self.package_root);
        env.apply_to(&mut cmd);

        let output = cmd.output().context("Failed to invoke sphinx")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "sphinx exited with {}: {}",
                output.status,
                stderr.trim_end()
            );
        }
        Ok(out_dir)
    }

    fn publish(&self, docs: &Path, credential: &Secret) -> anyhow::Result<()> {
        let output = Command::new("bash")
            .arg(&self.publish_script)
            .arg(docs)
            .env(Self::TOKEN_VAR, credential.expose())
            .current_dir(&self.package_root)
            .output()
            .with_context(|| {
                format!(
                    "Failed to invoke publish script: {}",
                    self.publish_script.display()
                )
            })?;
        if !output.status.success() {
            // Stderr is surfaced as-is; the script must not echo the token.
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "publish script exited with {}: {}",
                output.status,
                stderr.trim_end()
            );
        }
        Ok(())
    }
}

/// Build then publish for one deploying cell, mapping each stage's failure
/// into [`GantryError::DeployFailure`].
pub fn execute_deploy(
    publisher: &dyn DocsPublisher,
    env: &Environment,
    cell: &MatrixCell,
    credential: &Secret,
) -> Result<(), GantryError> {
    let docs = publisher
        .build(env, cell)
        .map_err(|cause| GantryError::DeployFailure {
            stage: DeployStage::Build,
            cause,
        })?;
    publisher
        .publish(&docs, credential)
        .map_err(|cause| GantryError::DeployFailure {
            stage: DeployStage::Publish,
            cause,
        })
}
