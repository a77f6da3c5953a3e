//! Gantry Core Library
//!
//! Provisions and tests a geospatial Python package across a declared
//! matrix of (python, gdal, proj) combinations: native builds served from
//! a persistent artifact cache, per-cell environment composition, an
//! ordered installation pipeline, partitioned test execution, and a single
//! documentation-deploy gate.

pub mod cache;
pub mod config;
pub mod deploy;
pub mod environment;
pub mod error;
pub mod fs;
pub mod native;
pub mod orchestrator;
pub mod pipeline;
pub mod testing;
pub mod types;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{BuildScripts, GantryConfig};

    // Cache
    pub use crate::cache::{ArtifactCache, BuildMarker, CacheEntry, CacheKey};

    // Native builds
    pub use crate::native::{BuildCoordinator, NativeBuilder, ScriptBuilder};

    // Environment
    pub use crate::environment::{Environment, InstallRoots, compose};

    // Pipeline
    pub use crate::pipeline::{InstallationPipeline, Pipeline, PipelineState};

    // Testing
    pub use crate::testing::{Partition, PytestRunner, TestReport, TestRunner};

    // Deploy
    pub use crate::deploy::{
        DeployDecision, DeploymentGate, DocsPublisher, GateState, Secret, SphinxPublisher,
    };

    // Orchestration
    pub use crate::orchestrator::{
        CellOutcome, CellReport, MatrixResult, Orchestrator, RunOptions, RunStatus, RunSummary,
    };

    // Errors and shared types
    pub use crate::error::{DeployStage, GantryError};
    pub use crate::types::{DeployTarget, Library, MatrixCell};
}
