//! Shared core types used across the cache, pipeline, and deploy layers.

use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

/// Native libraries the orchestrator knows how to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    /// Geospatial raster/vector data access.
    Gdal,
    /// Coordinate projection and transformation.
    Proj,
}

impl Library {
    pub const ALL: [Library; 2] = [Library::Proj, Library::Gdal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Library::Gdal => "gdal",
            Library::Proj => "proj",
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Library {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gdal" => Ok(Library::Gdal),
            "proj" => Ok(Library::Proj),
            other => anyhow::bail!("Unknown native library: {}", other),
        }
    }
}

/// One concrete (python, gdal, proj) combination to provision and test.
///
/// Cells are enumerated from the static `[[matrix]]` table in `gantry.toml`
/// and never mutated afterwards. Each cell is a fully isolated execution
/// context; duplicate cells waste work but cannot corrupt state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixCell {
    /// Interpreter version, e.g. "3.8". Selects the `pythonX.Y` executable.
    pub python: String,
    /// GDAL version to build and pin the binding against.
    pub gdal: Version,
    /// PROJ version to build.
    pub proj: Version,
}

impl MatrixCell {
    pub fn new(python: impl Into<String>, gdal: Version, proj: Version) -> Self {
        Self {
            python: python.into(),
            gdal,
            proj,
        }
    }

    /// Short human-readable identifier used in logs and reports.
    pub fn label(&self) -> String {
        format!("py{}-gdal{}-proj{}", self.python, self.gdal, self.proj)
    }

    pub fn version_of(&self, library: Library) -> &Version {
        match library {
            Library::Gdal => &self.gdal,
            Library::Proj => &self.proj,
        }
    }
}

impl fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// The single (branch, python) combination allowed to publish documentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTarget {
    pub branch: String,
    pub python: String,
}

impl DeployTarget {
    pub fn new(branch: impl Into<String>, python: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            python: python.into(),
        }
    }

    /// Structural predicate: the current branch and the cell's interpreter
    /// must both equal the configured target.
    pub fn matches(&self, branch: &str, cell: &MatrixCell) -> bool {
        self.branch == branch && self.python == cell.python
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(s: &str) -> Version {
        Version::parse(s).expect("valid version in test")
    }

    #[test]
    fn test_library_round_trips_through_str() {
        for library in Library::ALL {
            let parsed: Library = library.as_str().parse().expect("parse should succeed");
            assert_eq!(parsed, library);
        }
    }

    #[test]
    fn test_library_rejects_unknown_name() {
        assert!("geos".parse::<Library>().is_err());
    }

    #[test]
    fn test_cell_label_is_stable() {
        let cell = MatrixCell::new("3.8", version("3.0.4"), version("6.1.1"));
        assert_eq!(cell.label(), "py3.8-gdal3.0.4-proj6.1.1");
    }

    #[test]
    fn test_version_of_selects_per_library() {
        let cell = MatrixCell::new("3.6", version("3.0.2"), version("6.1.1"));
        assert_eq!(cell.version_of(Library::Gdal), &version("3.0.2"));
        assert_eq!(cell.version_of(Library::Proj), &version("6.1.1"));
    }

    #[test]
    fn test_deploy_target_requires_both_fields() {
        let target = DeployTarget::new("master", "3.8");
        let matching = MatrixCell::new("3.8", version("3.0.4"), version("6.1.1"));
        let wrong_python = MatrixCell::new("3.6", version("3.0.4"), version("6.1.1"));

        assert!(target.matches("master", &matching));
        assert!(!target.matches("develop", &matching));
        assert!(!target.matches("master", &wrong_python));
    }
}
