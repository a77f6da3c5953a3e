//! Deterministic fingerprinting of native install trees.
//!
//! A built GDAL or PROJ tree is fingerprinted once after the build and the
//! hash is recorded in the cache's version marker. Re-hashing the same tree
//! later must reproduce the value, so traversal order is fixed and the
//! marker file itself is excluded.

use std::fs;
use std::path::Path;

use anyhow::Context;

/// Compute a deterministic blake3 fingerprint of a directory tree.
///
/// # Algorithm
/// - Recursive traversal, entries sorted lexicographically.
/// - Files: `blake3(relative_path || 0x00 || content)`.
/// - Directories: `relative_path || 0xFF`, then recurse.
/// - Symlinks: `relative_path || 0x01 || target` (install trees carry
///   `libgdal.so -> libgdal.so.N` style links; the target string, not the
///   linked content, identifies them).
/// - `exclude` names are skipped at every depth.
pub fn fingerprint_tree(path: &Path, exclude: &[&str]) -> anyhow::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hash_dir_recursive(&mut hasher, path, "", exclude)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_dir_recursive(
    hasher: &mut blake3::Hasher,
    dir: &Path,
    base: &str,
    exclude: &[&str],
) -> anyhow::Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

    let mut sorted_entries: Vec<_> = entries
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;
    sorted_entries.sort_by_key(|e| e.file_name());

    for entry in sorted_entries {
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if exclude.iter().any(|skip| *skip == name_str) {
            continue;
        }
        let rel_path = if base.is_empty() {
            name_str.to_string()
        } else {
            format!("{}/{}", base, name_str)
        };

        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat file: {}", entry.path().display()))?;

        if ty.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("Failed to read symlink: {}", entry.path().display()))?;
            hasher.update(rel_path.as_bytes());
            hasher.update(&[0x01]);
            hasher.update(target.to_string_lossy().as_bytes());
        } else if ty.is_dir() {
            hasher.update(rel_path.as_bytes());
            hasher.update(&[0xFF]);
            hash_dir_recursive(hasher, &entry.path(), &rel_path, exclude)?;
        } else if ty.is_file() {
            hasher.update(rel_path.as_bytes());
            hasher.update(&[0x00]);
            let content = fs::read(entry.path())
                .with_context(|| format!("Failed to read file: {}", entry.path().display()))?;
            hasher.update(&content);
        } else {
            anyhow::bail!(
                "Unsupported filesystem entry type: {}",
                entry.path().display()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create_dir_all should succeed in test temp dirs");
        }
        fs::write(path, content).expect("write should succeed in test temp dirs");
    }

    #[test]
    fn test_fingerprint_is_stable_across_creation_order() {
        let tmp1 = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp1.path().join("bin/gdalinfo"), "binary a");
        write_file(&tmp1.path().join("lib/libgdal.so.26"), "library");

        let tmp2 = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp2.path().join("lib/libgdal.so.26"), "library");
        write_file(&tmp2.path().join("bin/gdalinfo"), "binary a");

        let hash1 = fingerprint_tree(tmp1.path(), &[]).expect("fingerprint should succeed");
        let hash2 = fingerprint_tree(tmp2.path(), &[]).expect("fingerprint should succeed");
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp.path().join("lib/libproj.so"), "v6.1.1");
        let before = fingerprint_tree(tmp.path(), &[]).expect("fingerprint should succeed");

        write_file(&tmp.path().join("lib/libproj.so"), "v6.2.1");
        let after = fingerprint_tree(tmp.path(), &[]).expect("fingerprint should succeed");
        assert_ne!(before, after);
    }

    #[test]
    fn test_excluded_names_do_not_affect_fingerprint() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp.path().join("share/proj/proj.db"), "data");
        let bare = fingerprint_tree(tmp.path(), &["gantry-build.json"])
            .expect("fingerprint should succeed");

        write_file(&tmp.path().join("gantry-build.json"), "{\"anything\": true}");
        let with_marker = fingerprint_tree(tmp.path(), &["gantry-build.json"])
            .expect("fingerprint should succeed");
        assert_eq!(bare, with_marker);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_hash_by_target() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp.path().join("lib/libgdal.so.26"), "library");
        std::os::unix::fs::symlink("libgdal.so.26", tmp.path().join("lib/libgdal.so"))
            .expect("symlink should succeed");

        let hash = fingerprint_tree(tmp.path(), &[]).expect("fingerprint should succeed");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_nonexistent_path_fails() {
        let result = fingerprint_tree(Path::new("/nonexistent/install/root"), &[]);
        assert!(result.is_err());
    }
}
