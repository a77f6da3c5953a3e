//! Persistent artifact cache for built native libraries.
//!
//! Compiling GDAL or PROJ takes minutes and dominates everything else in the
//! pipeline, so built trees are kept in a directory that survives across
//! runs, keyed by (library, version). A JSON version marker written after a
//! successful build is what distinguishes a reusable tree from a partial
//! one; a marker that disagrees with its key means the cache itself can no
//! longer be trusted and the whole run stops.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::GantryError;
use crate::fs::fingerprint_tree;
use crate::types::Library;

/// Marker file written into an install root after a successful build.
pub const MARKER_FILE: &str = "gantry-build.json";

/// Cache key: one native library at one exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub library: Library,
    pub version: Version,
}

impl CacheKey {
    pub fn new(library: Library, version: Version) -> Self {
        Self { library, version }
    }

    /// Directory name under the cache root, e.g. `gdal-3.0.4`.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.library, self.version)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.library, self.version)
    }
}

/// Contents of the version marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMarker {
    pub library: Library,
    pub version: Version,
    pub built_at: chrono::DateTime<chrono::Utc>,
    /// blake3 fingerprint of the install tree (marker excluded).
    pub fingerprint: String,
}

impl BuildMarker {
    fn matches(&self, key: &CacheKey) -> bool {
        self.library == key.library && self.version == key.version
    }

    fn describe(&self) -> String {
        format!("{} {}", self.library, self.version)
    }
}

/// A usable cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub install_root: PathBuf,
    /// True when the entry was produced by a build in the current run,
    /// false for a cache hit.
    pub freshly_built: bool,
}

/// What lives under a key's directory right now.
#[derive(Debug, Clone)]
pub enum RootState {
    /// Nothing on disk.
    Missing,
    /// A directory without a marker: an interrupted build. Must be cleared
    /// before rebuilding, never reused.
    Partial,
    /// Marker present and consistent with the key.
    Valid(BuildMarker),
}

/// Summary row for cache inspection.
#[derive(Debug, Clone)]
pub struct EntrySummary {
    pub dir_name: String,
    pub install_root: PathBuf,
    pub marker: Option<BuildMarker>,
}

/// Process-wide shared store of built native libraries.
///
/// Reads are concurrent; builds for the same key are serialized through
/// [`ArtifactCache::key_lock`] so exactly one build occurs per key per cache
/// lifetime, while distinct keys proceed independently.
#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache root: {}", root.display()))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical install root for a key.
    pub fn install_root(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    /// Per-key build lock, created on first access. Holding it for the
    /// duration of a build serializes concurrent `ensure` calls for the same
    /// key without blocking unrelated keys.
    pub fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("cache lock map poisoned");
        locks.entry(key.clone()).or_default().clone()
    }

    /// Classify the on-disk state for a key.
    pub fn classify(&self, key: &CacheKey) -> Result<RootState, GantryError> {
        let root = self.install_root(key);
        if !root.exists() {
            return Ok(RootState::Missing);
        }
        let marker_path = root.join(MARKER_FILE);
        if !marker_path.exists() {
            return Ok(RootState::Partial);
        }
        let marker = read_marker(&marker_path).map_err(|_| GantryError::CacheCorruption {
            path: root.clone(),
            expected: key.to_string(),
            found: "unreadable marker".to_string(),
        })?;
        if !marker.matches(key) {
            return Err(GantryError::CacheCorruption {
                path: root,
                expected: key.to_string(),
                found: marker.describe(),
            });
        }
        Ok(RootState::Valid(marker))
    }

    /// Idempotent, side-effect-free lookup. Partial roots report as absent;
    /// the builder is responsible for clearing them before rebuilding.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, GantryError> {
        match self.classify(key)? {
            RootState::Valid(_) => Ok(Some(CacheEntry {
                install_root: self.install_root(key),
                freshly_built: false,
            })),
            RootState::Missing | RootState::Partial => Ok(None),
        }
    }

    /// Register a freshly built install root under a key.
    ///
    /// Fingerprints the tree and writes the marker atomically (tmp +
    /// rename), so an interrupted store leaves a detectable partial root
    /// rather than a silently reusable one.
    pub fn store(&self, key: &CacheKey, install_root: &Path) -> Result<CacheEntry, GantryError> {
        let marker_path = install_root.join(MARKER_FILE);
        if marker_path.exists() {
            let existing = read_marker(&marker_path).map_err(|_| GantryError::CacheCorruption {
                path: install_root.to_path_buf(),
                expected: key.to_string(),
                found: "unreadable marker".to_string(),
            })?;
            if !existing.matches(key) {
                return Err(GantryError::CacheCorruption {
                    path: install_root.to_path_buf(),
                    expected: key.to_string(),
                    found: existing.describe(),
                });
            }
        }

        let fingerprint = fingerprint_tree(install_root, &[MARKER_FILE])
            .with_context(|| format!("Failed to fingerprint: {}", install_root.display()))?;
        let marker = BuildMarker {
            library: key.library,
            version: key.version.clone(),
            built_at: chrono::Utc::now(),
            fingerprint,
        };
        write_marker(&marker_path, &marker)?;
        tracing::debug!(key = %key, root = %install_root.display(), "registered build");

        Ok(CacheEntry {
            install_root: install_root.to_path_buf(),
            freshly_built: true,
        })
    }

    /// Remove a partial root left by an interrupted build. No-op when the
    /// key's directory is absent.
    pub fn clear_partial(&self, key: &CacheKey) -> anyhow::Result<()> {
        let root = self.install_root(key);
        if root.exists() {
            tracing::warn!(key = %key, root = %root.display(), "clearing partial build");
            fs::remove_dir_all(&root)
                .with_context(|| format!("Failed to clear partial build: {}", root.display()))?;
        }
        Ok(())
    }

    /// Recompute the tree fingerprint and compare it against the marker.
    pub fn verify(&self, key: &CacheKey) -> Result<bool, GantryError> {
        match self.classify(key)? {
            RootState::Valid(marker) => {
                let root = self.install_root(key);
                let current = fingerprint_tree(&root, &[MARKER_FILE])
                    .with_context(|| format!("Failed to fingerprint: {}", root.display()))?;
                Ok(current == marker.fingerprint)
            }
            _ => Ok(false),
        }
    }

    /// List everything under the cache root, markers included where present.
    pub fn entries(&self) -> anyhow::Result<Vec<EntrySummary>> {
        let mut summaries = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read cache root: {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let install_root = entry.path();
            let marker = read_marker(&install_root.join(MARKER_FILE)).ok();
            summaries.push(EntrySummary {
                dir_name: entry.file_name().to_string_lossy().to_string(),
                install_root,
                marker,
            });
        }
        summaries.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        Ok(summaries)
    }
}

fn read_marker(path: &Path) -> anyhow::Result<BuildMarker> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read marker: {}", path.display()))?;
    let marker: BuildMarker = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse marker: {}", path.display()))?;
    Ok(marker)
}

fn write_marker(path: &Path, marker: &BuildMarker) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(marker).context("Failed to serialize marker")?;
    let tmp_path = path.with_extension(format!("json.tmp.{}", std::process::id()));
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed to write tmp marker: {}", tmp_path.display()))?;
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove existing marker: {}", path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename tmp marker: {}", tmp_path.display()))?;
    Ok(())
}
