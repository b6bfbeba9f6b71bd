//! Confinement of tool paths to the data root.
//!
//! Candidate paths are interpreted relative to the data root. `..`
//! traversal above the root and symlinks resolving outside it are refused.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Resolve `candidate` to an existing canonical path inside `data_root`.
///
/// `data_root` must already be canonical. An empty candidate, `"."` and
/// `"/"` all name the root itself.
///
/// # Errors
///
/// - `AppError::PathViolation` if the path escapes the root lexically or
///   through a symlink.
/// - `AppError::InvalidParams` if the path does not exist.
pub fn resolve_within(data_root: &Path, candidate: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(candidate).components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(format!(
                        "{candidate} escapes the data root"
                    )));
                }
            }
            Component::CurDir | Component::RootDir => {}
            Component::Prefix(_) => {
                return Err(AppError::PathViolation(format!(
                    "{candidate} names another volume"
                )));
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    let joined = data_root.join(&normalized);
    let canonical = match joined.canonicalize() {
        Ok(path) => path,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::InvalidParams(format!("{candidate} does not exist")));
        }
        Err(err) => {
            return Err(AppError::PathViolation(format!(
                "cannot resolve {candidate}: {err}"
            )))
        }
    };

    if !canonical.starts_with(data_root) {
        return Err(AppError::PathViolation(format!(
            "{candidate} resolves outside the data root"
        )));
    }
    Ok(canonical)
}

/// Render `path` relative to `data_root` with forward slashes.
#[must_use]
pub fn display_relative(data_root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(data_root).unwrap_or(path);
    let rendered = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if rendered.is_empty() {
        ".".into()
    } else {
        rendered
    }
}
