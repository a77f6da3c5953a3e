//! Failure taxonomy for matrix runs.
//!
//! Fatality levels differ per variant: `CacheCorruption` poisons the shared
//! cache and aborts the entire run; `BuildFailure` and `InstallStepFailure`
//! abort only the owning cell; `TestPartitionFailure` is recorded while the
//! cell keeps reporting; `DeployFailure` fails the deploy attempt without
//! disturbing already-reported test results.

use std::path::PathBuf;

use semver::Version;

use crate::testing::Partition;
use crate::types::Library;

#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    /// The opaque native build script failed. Not retried: native compile
    /// failures are deterministic (missing headers, unsupported version).
    #[error("failed to build {library} {version}")]
    BuildFailure {
        library: Library,
        version: Version,
        #[source]
        cause: anyhow::Error,
    },

    /// The cache directory for a key holds a different build than the key
    /// claims. Silently mixing native versions produces undefined numeric
    /// behavior downstream, so the whole run stops here.
    #[error("artifact cache corrupted at {}: marker says {found}, expected {expected}", .path.display())]
    CacheCorruption {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// One of the ordered installation steps failed. `step` is 1-based to
    /// match operator-facing numbering; `completed` lists the steps that
    /// finished before the failure.
    #[error("install step {step} ({name}) failed for cell {cell}")]
    InstallStepFailure {
        step: usize,
        name: &'static str,
        cell: String,
        completed: Vec<&'static str>,
        #[source]
        cause: anyhow::Error,
    },

    /// A test partition could not produce a report (runner invocation or
    /// output parsing failed). Recorded on the cell; the other partition
    /// still runs.
    #[error("test partition '{partition}' produced no report")]
    TestPartitionFailure {
        partition: Partition,
        #[source]
        cause: anyhow::Error,
    },

    /// Documentation build or publish failed after the matrix went green.
    #[error("documentation deploy failed during {stage}")]
    DeployFailure {
        stage: DeployStage,
        #[source]
        cause: anyhow::Error,
    },

    /// Anything outside the taxonomy (I/O, configuration) that still aborts
    /// the operation that hit it.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GantryError {
    /// True only for failures that make the shared cache untrustworthy for
    /// every cell, not just the one that hit them.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, GantryError::CacheCorruption { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStage {
    Build,
    Publish,
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployStage::Build => f.write_str("build"),
            DeployStage::Publish => f.write_str("publish"),
        }
    }
}
