//! Filesystem document loader.
//!
//! Walks a directory, applies include/exclude globs, and reads every
//! matching file as a [`SourceDocument`] with its format inferred from the
//! extension. Files are returned sorted by relative path, so document
//! order (and with it tie-breaking in retrieval) is deterministic.

use std::path::Path;

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use testbrain_core::models::{DocumentFormat, SourceDocument};
use walkdir::WalkDir;

use crate::config::LoaderConfig;

/// Load every matching document under `root`.
///
/// Matching files whose extension maps to no known format are skipped with
/// a warning.
pub fn load_directory(root: &Path, config: &LoaderConfig) -> Result<Vec<SourceDocument>> {
    if !root.exists() {
        bail!("Document directory does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut docs = Vec::new();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let Some(format) = DocumentFormat::from_path(path) else {
            tracing::warn!(path = %rel_str, "skipping file with unknown format");
            continue;
        };

        let content =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        docs.push(SourceDocument::new(rel_str.clone(), rel_str, format, content));
    }

    docs.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::debug!(root = %root.display(), documents = docs.len(), "loaded documents");

    Ok(docs)
}

/// Load a single file. `format` overrides extension-based detection.
pub fn load_file(path: &Path, format: Option<&str>) -> Result<SourceDocument> {
    let format = match format {
        Some(tag) => DocumentFormat::from_tag(tag)
            .with_context(|| format!("Unsupported format tag: {}", tag))?,
        None => DocumentFormat::from_path(path)
            .with_context(|| format!("Cannot infer format of {}", path.display()))?,
    };
    let content =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    Ok(SourceDocument::new(name.clone(), name, format, content))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
