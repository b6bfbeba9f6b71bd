//! `list_files` — directory listing under the data root.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use glob::Pattern;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::util;
use super::ToolDescriptor;
use crate::engine::cache::CacheKey;
use crate::engine::emitter::ToolOutput;
use crate::mcp::context::ToolContext;
use crate::{AppError, Result};

/// Arguments for `list_files`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListFilesInput {
    /// Directory relative to the data root; defaults to the root.
    #[serde(default)]
    pub path: Option<String>,
    /// Descend into subdirectories.
    #[serde(default)]
    pub recursive: bool,
    /// Optional glob applied to entry file names, e.g. `*.csv`.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Tool descriptor.
#[must_use]
pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        "list_files",
        "List files and directories under the data root.",
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory relative to the data root" },
                "recursive": { "type": "boolean", "default": false },
                "pattern": { "type": "string", "description": "Glob matched against entry names" }
            },
            "additionalProperties": false
        }),
    )
}

/// Handle a `list_files` call.
///
/// # Errors
///
/// Returns path, pattern, I/O or capacity failures.
pub async fn handle(ctx: ToolContext, input: ListFilesInput) -> Result<ToolOutput> {
    let dir = ctx.engine.resolve(input.path.as_deref().unwrap_or("."))?;
    let display = ctx.engine.relative(&dir);
    let meta = tokio::fs::metadata(&dir).await?;
    if !meta.is_dir() {
        return Err(AppError::InvalidParams(format!("{display} is not a directory")));
    }
    let pattern = input
        .pattern
        .as_deref()
        .map(Pattern::new)
        .transpose()
        .map_err(|err| AppError::InvalidParams(format!("invalid pattern: {err}")))?;

    let key = CacheKey::new(
        "list_files",
        &json!({
            "path": display,
            "recursive": input.recursive,
            "pattern": input.pattern,
            "mtime": util::mtime_nanos(meta.modified().ok()).to_string(),
        }),
    );

    let root = ctx.engine.data_root().to_path_buf();
    let recursive = input.recursive;
    let engine = Arc::clone(&ctx.engine);
    let job_key = display.clone();
    let listing = ctx
        .engine
        .cache
        .get_or_compute(&key, &ctx.cancel, move |cancel| async move {
            let handle = engine
                .pool
                .submit(job_key, cancel, move |cancel| {
                    walk(&root, &dir, recursive, pattern.as_ref(), cancel)
                })
                .await?;
            let (_, entries) = handle.join().await;
            entries.map(Value::Array)
        })
        .await?;

    let entries = match &*listing {
        Value::Array(entries) => entries.clone(),
        _ => Vec::new(),
    };
    let mut trailer = Map::new();
    trailer.insert("path".into(), json!(display));
    trailer.insert("recursive".into(), json!(recursive));
    Ok(ToolOutput::Items {
        items: stream::iter(entries.into_iter().map(Ok)).boxed(),
        trailer,
    })
}

fn walk(
    root: &Path,
    dir: &Path,
    recursive: bool,
    pattern: Option<&Pattern>,
    cancel: &CancellationToken,
) -> Result<Vec<Value>> {
    let mut entries = Vec::new();
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled("listing cancelled".into()));
        }
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            // Symlinks are reported but never followed.
            let meta = fs::symlink_metadata(&path)?;
            let kind = if meta.file_type().is_symlink() {
                "symlink"
            } else if meta.is_dir() {
                if recursive {
                    pending.push(path.clone());
                }
                "dir"
            } else {
                "file"
            };
            let name = entry.file_name();
            if pattern.is_some_and(|p| !p.matches(&name.to_string_lossy())) {
                continue;
            }
            entries.push(json!({
                "path": crate::engine::path_safety::display_relative(root, &path),
                "kind": kind,
                "size": meta.len(),
                "modified": util::mtime_rfc3339(meta.modified().ok()),
            }));
        }
    }
    entries.sort_by(|a, b| a["path"].as_str().cmp(&b["path"].as_str()));
    Ok(entries)
}
