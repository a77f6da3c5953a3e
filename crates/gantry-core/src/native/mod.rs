//! Native library builds: opaque build scripts plus cache coordination.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use semver::Version;

use crate::cache::{ArtifactCache, CacheEntry, CacheKey};
use crate::config::BuildScripts;
use crate::error::GantryError;
use crate::types::Library;

/// Capability to produce a native-library install tree.
///
/// Build scripts are opaque to the orchestrator: deterministic for a given
/// version and loud on failure. Tests substitute a fake that writes canned
/// trees instantly, so the orchestrator's own suite never compiles GDAL.
pub trait NativeBuilder {
    /// Build `library` at `version` into `target_root`. The directory may
    /// not exist yet; a failed build may leave arbitrary debris there, which
    /// the caller clears before retrying in a later run.
    fn build(&self, library: Library, version: &Version, target_root: &Path)
    -> anyhow::Result<()>;
}

/// Production builder invoking the configured per-library shell script as
/// `bash <script> <version> <target_root>`.
#[derive(Debug)]
pub struct ScriptBuilder {
    scripts: BuildScripts,
    workdir: PathBuf,
}

impl ScriptBuilder {
    pub fn new(scripts: BuildScripts, workdir: PathBuf) -> Self {
        Self { scripts, workdir }
    }
}

impl NativeBuilder for ScriptBuilder {
    fn build(
        &self,
        library: Library,
        version: &Version,
        target_root: &Path,
    ) -> anyhow::Result<()> {
        let script = self.scripts.for_library(library);
        tracing::info!(%library, %version, script = %script.display(), "building native library");

        let output = Command::new("bash")
            .arg(script)
            .arg(version.to_string())
            .arg(target_root)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("Failed to invoke build script: {}", script.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Build script {} exited with {}: {}",
                script.display(),
                output.status,
                tail(&stderr, 20)
            );
        }
        Ok(())
    }
}

/// Last `lines` of a command transcript, enough to attribute the failure
/// without replaying a full compile log.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Couples the cache with a builder: lookups are served from disk, misses
/// build exactly once under the key's lock.
pub struct BuildCoordinator<'a> {
    cache: &'a ArtifactCache,
    builder: &'a dyn NativeBuilder,
}

impl<'a> BuildCoordinator<'a> {
    pub fn new(cache: &'a ArtifactCache, builder: &'a dyn NativeBuilder) -> Self {
        Self { cache, builder }
    }

    /// Return the install root for (library, version), building on miss.
    ///
    /// Cache hits return unchanged, so calling this twice with the same key
    /// triggers at most one build per cache lifetime. Concurrent calls for
    /// the same key serialize on the per-key lock; the loser of the race
    /// re-checks and takes the hit path. Build failures surface as
    /// [`GantryError::BuildFailure`] and are never retried within a run.
    pub fn ensure(&self, library: Library, version: &Version) -> Result<CacheEntry, GantryError> {
        let key = CacheKey::new(library, version.clone());
        if let Some(entry) = self.cache.lookup(&key)? {
            tracing::debug!(key = %key, "cache hit");
            return Ok(entry);
        }

        let lock = self.cache.key_lock(&key);
        let _guard = lock.lock().expect("build lock poisoned");

        // Another caller may have finished the build while we waited.
        if let Some(entry) = self.cache.lookup(&key)? {
            return Ok(entry);
        }

        self.cache.clear_partial(&key)?;
        let target_root = self.cache.install_root(&key);
        self.builder
            .build(library, version, &target_root)
            .map_err(|cause| GantryError::BuildFailure {
                library,
                version: version.clone(),
                cause,
            })?;

        self.cache.store(&key, &target_root)
    }
}
