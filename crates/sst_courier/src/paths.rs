//! Source and destination root handling.

use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RootPathError {
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Not a directory: {}", .0.display())]
    NotDirectory(PathBuf),

    #[error("Cannot read directory: {}", .0.display())]
    NotReadable(PathBuf),

    #[error(
        "{} and {} overlap; neither root may contain the other",
        .source_root.display(),
        .destination_root.display()
    )]
    Overlapping {
        source_root: PathBuf,
        destination_root: PathBuf,
    },
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~").unwrap_or(path));
        }
    }
    path.to_path_buf()
}

/// The source root must be an existing, listable directory.
pub fn validate_source_root(path: &Path) -> Result<(), RootPathError> {
    if !path.exists() {
        return Err(RootPathError::NotFound(path.to_path_buf()));
    }
    if !path.is_dir() {
        return Err(RootPathError::NotDirectory(path.to_path_buf()));
    }
    if fs::read_dir(path).is_err() {
        return Err(RootPathError::NotReadable(path.to_path_buf()));
    }
    Ok(())
}

/// Absolute form of `path` for comparisons.
///
/// `.` and `..` are folded lexically, then the longest existing ancestor is
/// canonicalised (resolving symlinks) and the missing remainder re-appended.
pub fn comparable_path(path: &Path) -> PathBuf {
    let normalized = fold_dots(path);
    let mut existing = normalized.as_path();
    let mut missing = Vec::new();
    let mut resolved = loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            break canonical;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break existing.to_path_buf(),
        }
    };
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }
    resolved
}

fn fold_dots(path: &Path) -> PathBuf {
    let mut folded = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !folded.pop() {
                    folded.push(component);
                }
            }
            other => folded.push(other),
        }
    }
    folded
}

/// Neither root may equal or contain the other.
pub fn ensure_disjoint_roots(source: &Path, destination: &Path) -> Result<(), RootPathError> {
    let source_cmp = comparable_path(source);
    let destination_cmp = comparable_path(destination);
    if source_cmp.starts_with(&destination_cmp) || destination_cmp.starts_with(&source_cmp) {
        return Err(RootPathError::Overlapping {
            source_root: source.to_path_buf(),
            destination_root: destination.to_path_buf(),
        });
    }
    Ok(())
}

/// `true` when both paths name the same file, directly or through links.
pub fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
