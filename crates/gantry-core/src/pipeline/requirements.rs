//! Requirements-file surgery for the pinned native binding.
//!
//! The binding's version must match the just-built native library exactly.
//! A pinned line in the requirements file would override that, and a
//! mismatched binding can import cleanly while misreading raster data, so
//! the line is removed before the bulk install and the binding is installed
//! separately with an exact pin.

use std::fs;
use std::path::Path;

use anyhow::Context;

/// Remove every requirement line whose distribution name equals `binding`.
///
/// Matching is exact on the distribution name only, normalized per PEP 503
/// (case-insensitive; `-`, `_` and `.` are interchangeable). Version
/// specifiers, extras, comments, and every other line pass through
/// byte-for-byte in their original order. Returns the number of lines
/// removed; the file is rewritten only when something was removed.
pub fn strip_pinned(path: &Path, binding: &str) -> anyhow::Result<usize> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read requirements: {}", path.display()))?;

    let mut kept = Vec::new();
    let mut removed = 0;
    for line in content.lines() {
        if distribution_name(line).is_some_and(|name| names_equal(name, binding)) {
            removed += 1;
        } else {
            kept.push(line);
        }
    }

    if removed > 0 {
        let mut rewritten = kept.join("\n");
        if content.ends_with('\n') {
            rewritten.push('\n');
        }
        fs::write(path, rewritten)
            .with_context(|| format!("Failed to rewrite requirements: {}", path.display()))?;
        tracing::debug!(
            file = %path.display(),
            binding,
            removed,
            "stripped pinned binding"
        );
    }
    Ok(removed)
}

/// Distribution name of a requirement line, or `None` for blanks, comments,
/// and option lines.
fn distribution_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('-') {
        return None;
    }
    let end = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(trimmed.len());
    if end == 0 { None } else { Some(&trimmed[..end]) }
}

/// PEP 503 name equality.
fn names_equal(a: &str, b: &str) -> bool {
    let canon = |name: &str| {
        name.chars()
            .map(|c| match c {
                '-' | '_' | '.' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect::<String>()
    };
    canon(a) == canon(b)
}
