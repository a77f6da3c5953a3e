//! Matrix declaration and run configuration loaded from `gantry.toml`.
//!
//! The matrix is configuration, not code: adding a cell is a data change.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::{DeployTarget, Library, MatrixCell};

/// Default file name looked up in the package root.
pub const CONFIG_FILE: &str = "gantry.toml";

/// Per-library opaque build scripts.
///
/// Each script receives the version string and the target install root as
/// positional arguments and must be deterministic for a given version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildScripts {
    #[serde(default = "default_gdal_script")]
    pub gdal: PathBuf,
    #[serde(default = "default_proj_script")]
    pub proj: PathBuf,
}

impl BuildScripts {
    pub fn for_library(&self, library: Library) -> &Path {
        match library {
            Library::Gdal => &self.gdal,
            Library::Proj => &self.proj,
        }
    }
}

impl Default for BuildScripts {
    fn default() -> Self {
        Self {
            gdal: default_gdal_script(),
            proj: default_proj_script(),
        }
    }
}

fn default_gdal_script() -> PathBuf {
    PathBuf::from("scripts/build-gdal.sh")
}

fn default_proj_script() -> PathBuf {
    PathBuf::from("scripts/build-proj.sh")
}

fn default_requirements() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_publish_script() -> PathBuf {
    PathBuf::from("scripts/publish-docs.sh")
}

fn default_binding() -> String {
    "GDAL".to_string()
}

/// Top-level configuration: declared matrix, deploy target, and the paths
/// the pipeline operates on. All relative paths resolve against the package
/// root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GantryConfig {
    /// Checkout of the package to provision and test.
    #[serde(default)]
    pub package_root: Option<PathBuf>,

    /// Requirements file with `name==version` lines.
    #[serde(default = "default_requirements")]
    pub requirements: PathBuf,

    /// Distribution name of the python binding pinned to the native build.
    #[serde(default = "default_binding")]
    pub binding: String,

    /// Test fixture forced read-only before the suite runs.
    #[serde(default)]
    pub fixture: Option<PathBuf>,

    /// Optional coverage configuration passed to pytest on the fast partition.
    #[serde(default)]
    pub coverage_config: Option<PathBuf>,

    /// Persistent cache for built native libraries. Defaults to the user
    /// state directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub build: BuildScripts,

    /// Script invoked with the built docs tree; receives the publish token
    /// through the environment, never argv.
    #[serde(default = "default_publish_script")]
    pub publish_script: PathBuf,

    /// Declared matrix cells, provisioned and tested in order.
    #[serde(rename = "matrix", default)]
    pub matrix: Vec<MatrixCell>,

    /// The one (branch, python) combination allowed to publish docs.
    #[serde(default)]
    pub deploy: Option<DeployTarget>,
}

impl GantryConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: GantryConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.matrix.is_empty() {
            anyhow::bail!("Config declares no matrix cells");
        }
        for cell in &self.matrix {
            validate_python_version(&cell.python)
                .with_context(|| format!("Invalid matrix cell {}", cell.label()))?;
        }
        if let Some(target) = &self.deploy {
            validate_python_version(&target.python).context("Invalid deploy target")?;
            if target.branch.is_empty() {
                anyhow::bail!("Deploy target branch must not be empty");
            }
        }
        if self.binding.is_empty() {
            anyhow::bail!("Binding distribution name must not be empty");
        }
        Ok(())
    }

    /// Package root, defaulting to the current directory.
    pub fn package_root(&self) -> PathBuf {
        self.package_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a configured path against the package root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.package_root().join(path)
        }
    }

    /// Cache directory: configured value, or the persistent default under
    /// the user state dir.
    ///
    /// # Returns
    /// - Unix: `$XDG_STATE_HOME/gantry/builds` or `~/.local/state/gantry/builds`
    /// - Windows: `%LOCALAPPDATA%\gantry\builds`
    pub fn resolved_cache_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(self.resolve(dir));
        }
        default_cache_dir()
    }
}

/// Default persistent cache location in the user state directory.
pub fn default_cache_dir() -> anyhow::Result<PathBuf> {
    let base = if cfg!(unix) {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or_else(|| anyhow::anyhow!("Cannot determine state directory"))?
    } else {
        dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine local app data directory"))?
    };
    Ok(base.join("gantry").join("builds"))
}

fn validate_python_version(version: &str) -> anyhow::Result<()> {
    let mut parts = version.split('.');
    let valid = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(major), Some(minor), None)
            if !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
    );
    if !valid {
        anyhow::bail!("Interpreter version must look like '3.8', got '{}'", version);
    }
    Ok(())
}
