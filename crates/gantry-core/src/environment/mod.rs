//! Per-cell process environment composition.
//!
//! The composed environment is a value, not a mutation of the ambient
//! process environment: it is threaded through the pipeline and applied
//! explicitly to each spawned command. Cell isolation falls out by
//! construction, since no cell can observe variables another cell composed.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

/// How one variable is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// Replace whatever the child would inherit.
    Set(String),
    /// Path entries joined ahead of the inherited value.
    Prepend(Vec<PathBuf>),
}

/// Ordered variable set scoped to one matrix cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, EnvValue>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), EnvValue::Set(value.into()));
    }

    /// Add a search-path entry. A variable is either replaced or prepended,
    /// never both: prepending onto a previously `set` name discards the set
    /// value.
    pub fn prepend(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        let entry = self
            .vars
            .entry(name.into())
            .or_insert_with(|| EnvValue::Prepend(Vec::new()));
        if let EnvValue::Set(_) = entry {
            *entry = EnvValue::Prepend(Vec::new());
        }
        if let EnvValue::Prepend(paths) = entry {
            paths.push(path.into());
        }
    }

    pub fn get(&self, name: &str) -> Option<&EnvValue> {
        self.vars.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvValue)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Resolve every variable against a base lookup standing in for the
    /// environment the child process would inherit.
    pub fn merged_with(
        &self,
        base: impl Fn(&str) -> Option<String>,
    ) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .map(|(name, value)| {
                let resolved = match value {
                    EnvValue::Set(v) => v.clone(),
                    EnvValue::Prepend(paths) => {
                        let mut entries: Vec<OsString> =
                            paths.iter().map(|p| p.clone().into_os_string()).collect();
                        if let Some(inherited) = base(name) {
                            entries.extend(env::split_paths(&inherited).map(PathBuf::into_os_string));
                        }
                        env::join_paths(entries)
                            .map(|joined| joined.to_string_lossy().to_string())
                            .unwrap_or_else(|_| String::new())
                    }
                };
                (name.clone(), resolved)
            })
            .collect()
    }

    /// Apply to a command about to be spawned. Prepend entries merge ahead
    /// of the parent process value; nothing in the parent environment is
    /// mutated.
    pub fn apply_to(&self, cmd: &mut Command) {
        for (name, value) in self.merged_with(|name| env::var(name).ok()) {
            cmd.env(name, value);
        }
    }

    /// True when any entry points at or below `root`. Used to assert that a
    /// cell's environment never leaks another cell's install roots.
    pub fn references(&self, root: &Path) -> bool {
        self.vars.values().any(|value| match value {
            EnvValue::Set(v) => Path::new(v).starts_with(root),
            EnvValue::Prepend(paths) => paths.iter().any(|p| p.starts_with(root)),
        })
    }
}

/// Install roots the environment is derived from.
#[derive(Debug, Clone)]
pub struct InstallRoots {
    pub gdal: PathBuf,
    pub proj: PathBuf,
}

/// Derive the variables that make one cell's native builds visible to the
/// interpreter, the binding compiler, and the test suite.
///
/// Pure: the same install roots always produce the same variable set.
pub fn compose(roots: &InstallRoots) -> Environment {
    let mut env = Environment::new();
    env.prepend("PATH", roots.gdal.join("bin"));
    env.prepend("LD_LIBRARY_PATH", roots.gdal.join("lib"));
    env.prepend("LD_LIBRARY_PATH", roots.proj.join("lib"));
    env.prepend("C_INCLUDE_PATH", roots.gdal.join("include"));
    env.prepend("CPLUS_INCLUDE_PATH", roots.gdal.join("include"));
    env.set(
        "GDAL_DATA",
        roots.gdal.join("share").join("gdal").to_string_lossy(),
    );
    env.set(
        "PROJ_LIB",
        roots.proj.join("share").join("proj").to_string_lossy(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(base: &str) -> InstallRoots {
        InstallRoots {
            gdal: PathBuf::from(format!("{base}/gdal-3.0.4")),
            proj: PathBuf::from(format!("{base}/proj-6.1.1")),
        }
    }

    #[test]
    fn test_compose_is_deterministic() {
        let a = compose(&roots("/cache"));
        let b = compose(&roots("/cache"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_compose_sets_data_dirs() {
        let env = compose(&roots("/cache"));
        assert_eq!(
            env.get("GDAL_DATA"),
            Some(&EnvValue::Set("/cache/gdal-3.0.4/share/gdal".to_string()))
        );
        assert_eq!(
            env.get("PROJ_LIB"),
            Some(&EnvValue::Set("/cache/proj-6.1.1/share/proj".to_string()))
        );
    }

    #[test]
    fn test_prepend_lands_ahead_of_inherited_value() {
        let env = compose(&roots("/cache"));
        let merged = env.merged_with(|name| match name {
            "PATH" => Some("/usr/bin:/bin".to_string()),
            _ => None,
        });
        assert_eq!(
            merged.get("PATH").map(String::as_str),
            Some("/cache/gdal-3.0.4/bin:/usr/bin:/bin")
        );
        assert_eq!(
            merged.get("LD_LIBRARY_PATH").map(String::as_str),
            Some("/cache/gdal-3.0.4/lib:/cache/proj-6.1.1/lib")
        );
    }

    #[test]
    fn test_environments_do_not_share_roots_across_cells() {
        let cell_a = compose(&roots("/cache/a"));
        let cell_b = compose(&roots("/cache/b"));

        assert!(cell_a.references(Path::new("/cache/a/gdal-3.0.4")));
        assert!(!cell_a.references(Path::new("/cache/b/gdal-3.0.4")));
        assert!(!cell_b.references(Path::new("/cache/a/proj-6.1.1")));
    }
}
