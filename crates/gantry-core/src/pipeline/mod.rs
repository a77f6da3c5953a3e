//! The per-cell installation pipeline.
//!
//! Eight ordered steps provision one matrix cell. Later steps assume
//! earlier steps' postconditions (the binding install needs the stripped
//! requirements already applied, the package install needs the binding),
//! so the first failure aborts the remainder of the cell. Nothing here is
//! retried: install failures are deterministic configuration problems.

pub mod requirements;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;

use crate::config::GantryConfig;
use crate::environment::Environment;
use crate::error::GantryError;
use crate::types::MatrixCell;

/// Ordered log of completed step names for one cell. Diagnostics only;
/// dropped when the cell finishes.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    completed: Vec<&'static str>,
}

impl PipelineState {
    fn record(&mut self, name: &'static str) {
        self.completed.push(name);
    }

    pub fn completed(&self) -> &[&'static str] {
        &self.completed
    }
}

/// Seam for orchestrator tests: the production pipeline shells out to pip,
/// fakes record the environment they were handed.
pub trait Pipeline {
    fn run(&self, env: &Environment, cell: &MatrixCell) -> Result<PipelineState, GantryError>;
}

/// Production pipeline operating on a package checkout.
#[derive(Debug)]
pub struct InstallationPipeline {
    package_root: PathBuf,
    requirements: PathBuf,
    binding: String,
    fixture: Option<PathBuf>,
}

impl InstallationPipeline {
    pub fn new(config: &GantryConfig) -> Self {
        Self {
            package_root: config.package_root(),
            requirements: config.resolve(&config.requirements),
            binding: config.binding.clone(),
            fixture: config.fixture.as_deref().map(|f| config.resolve(f)),
        }
    }

    fn run_steps(
        &self,
        env: &Environment,
        cell: &MatrixCell,
    ) -> Result<PipelineState, GantryError> {
        let python = python_executable(&cell.python);
        let binding_pin = format!("{}=={}", self.binding, cell.gdal);
        let requirements_arg = self.requirements.to_string_lossy().to_string();
        let mut state = PipelineState::default();

        self.step(cell, &mut state, 1, "upgrade-pip", || {
            self.run_python(env, &python, &["-m", "pip", "install", "--upgrade", "pip"])
        })?;
        self.step(cell, &mut state, 2, "install-build-helper", || {
            self.run_python(env, &python, &["-m", "pip", "install", "wheel"])
        })?;
        self.step(cell, &mut state, 3, "strip-pinned-binding", || {
            requirements::strip_pinned(&self.requirements, &self.binding).map(|_| ())
        })?;
        self.step(cell, &mut state, 4, "install-requirements", || {
            self.run_python(
                env,
                &python,
                &["-m", "pip", "install", "-r", &requirements_arg],
            )
        })?;
        self.step(cell, &mut state, 5, "install-binding", || {
            self.run_python(env, &python, &["-m", "pip", "install", &binding_pin])
        })?;
        self.step(cell, &mut state, 6, "install-package", || {
            self.run_python(env, &python, &["-m", "pip", "install", "."])
        })?;
        self.step(cell, &mut state, 7, "clean-build-metadata", || {
            remove_egg_info(&self.package_root)
        })?;
        self.step(cell, &mut state, 8, "fixture-read-only", || {
            match &self.fixture {
                Some(fixture) => make_read_only(fixture),
                None => Ok(()),
            }
        })?;

        Ok(state)
    }

    fn step(
        &self,
        cell: &MatrixCell,
        state: &mut PipelineState,
        index: usize,
        name: &'static str,
        action: impl FnOnce() -> anyhow::Result<()>,
    ) -> Result<(), GantryError> {
        action().map_err(|cause| GantryError::InstallStepFailure {
            step: index,
            name,
            cell: cell.label(),
            completed: state.completed().to_vec(),
            cause,
        })?;
        tracing::debug!(cell = %cell, step = index, name, "install step complete");
        state.record(name);
        Ok(())
    }

    fn run_python(&self, env: &Environment, python: &str, args: &[&str]) -> anyhow::Result<()> {
        let mut cmd = Command::new(python);
        cmd.args(args).current_dir(&self.package_root);
        env.apply_to(&mut cmd);

        let output = cmd
            .output()
            .with_context(|| format!("Failed to invoke {}", python))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "`{} {}` exited with {}: {}",
                python,
                args.join(" "),
                output.status,
                stderr.trim_end()
            );
        }
        Ok(())
    }
}

impl Pipeline for InstallationPipeline {
    fn run(&self, env: &Environment, cell: &MatrixCell) -> Result<PipelineState, GantryError> {
        tracing::info!(cell = %cell, "running installation pipeline");
        self.run_steps(env, cell)
    }
}

/// `python3.8`-style executable name for a cell's interpreter version.
pub fn python_executable(version: &str) -> String {
    format!("python{version}")
}

/// Remove `*.egg-info` directories left by the source install. Stale build
/// metadata confuses unrelated tooling running later in the same tree.
fn remove_egg_info(package_root: &Path) -> anyhow::Result<()> {
    let entries = fs::read_dir(package_root)
        .with_context(|| format!("Failed to read package root: {}", package_root.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_dir() && name.to_string_lossy().ends_with(".egg-info") {
            fs::remove_dir_all(entry.path()).with_context(|| {
                format!("Failed to remove build metadata: {}", entry.path().display())
            })?;
        }
    }
    Ok(())
}

/// Force a fixture to mode 0o444. One test exercises read-only-file
/// handling and must not pass merely because the checkout left the fixture
/// writable.
pub fn make_read_only(path: &Path) -> anyhow::Result<()> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to stat fixture: {}", path.display()))?;
    let mut permissions = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(0o444);
    }
    #[cfg(not(unix))]
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to set fixture read-only: {}", path.display()))?;
    Ok(())
}
