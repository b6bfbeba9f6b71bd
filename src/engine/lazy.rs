//! Reference-counted, lazily opened file handles.
//!
//! Every concurrent holder of the same path shares one slot. The underlying
//! file is opened on first read, not on acquire, and closed when the last
//! holder releases its handle.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{AppError, Result};

struct Slot {
    path: PathBuf,
    file: OnceCell<Arc<File>>,
}

struct Owner {
    slot: Arc<Slot>,
    holders: usize,
}

/// Handle usage counters for `/stats`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HandleStats {
    /// Paths with at least one holder.
    pub live: usize,
    /// Files currently open.
    pub open: u64,
    /// Files opened since start.
    pub opened: u64,
    /// Files closed since start.
    pub closed: u64,
}

/// Owner records for every path with at least one holder.
#[derive(Default)]
pub struct HandleRegistry {
    owners: Mutex<HashMap<PathBuf, Owner>>,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl HandleRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference to `path`. Nothing is opened yet.
    pub fn acquire(self: &Arc<Self>, path: &Path) -> LazyHandle {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        let owner = owners.entry(path.to_path_buf()).or_insert_with(|| Owner {
            slot: Arc::new(Slot {
                path: path.to_path_buf(),
                file: OnceCell::new(),
            }),
            holders: 0,
        });
        owner.holders += 1;
        LazyHandle {
            registry: Arc::clone(self),
            slot: Arc::clone(&owner.slot),
        }
    }

    /// Number of holders currently sharing `path`.
    #[must_use]
    pub fn holders(&self, path: &Path) -> usize {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map_or(0, |o| o.holders)
    }

    /// Usage counters.
    #[must_use]
    pub fn stats(&self) -> HandleStats {
        let live = self
            .owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let opened = self.opened.load(Ordering::Relaxed);
        let closed = self.closed.load(Ordering::Relaxed);
        HandleStats {
            live,
            open: opened.saturating_sub(closed),
            opened,
            closed,
        }
    }

    fn release(&self, slot: &Arc<Slot>) {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(owner) = owners.get_mut(&slot.path) else {
            return;
        };
        if !Arc::ptr_eq(&owner.slot, slot) {
            return;
        }
        owner.holders -= 1;
        if owner.holders == 0 {
            owners.remove(&slot.path);
            if slot.file.initialized() {
                self.closed.fetch_add(1, Ordering::Relaxed);
                debug!(path = %slot.path.display(), "closed data file");
            }
        }
    }
}

/// One holder's reference to a shared data file.
pub struct LazyHandle {
    registry: Arc<HandleRegistry>,
    slot: Arc<Slot>,
}

impl LazyHandle {
    /// Path this handle refers to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.slot.path
    }

    /// Whether the file has been opened by any holder.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.slot.file.initialized()
    }

    /// The shared open file, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the file cannot be opened.
    pub async fn file(&self) -> Result<Arc<File>> {
        let registry = &self.registry;
        let path = self.slot.path.clone();
        self.slot
            .file
            .get_or_try_init(|| async move {
                let file = tokio::task::spawn_blocking(move || File::open(&path))
                    .await
                    .map_err(|err| AppError::Internal(format!("open task failed: {err}")))??;
                registry.opened.fetch_add(1, Ordering::Relaxed);
                Ok::<_, AppError>(Arc::new(file))
            })
            .await
            .cloned()
    }

    /// Current file length in bytes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when metadata cannot be read.
    pub async fn len(&self) -> Result<u64> {
        let file = self.file().await?;
        tokio::task::spawn_blocking(move || file.metadata().map(|m| m.len()))
            .await
            .map_err(|err| AppError::Internal(format!("metadata task failed: {err}")))?
            .map_err(AppError::from)
    }

    /// Read up to `length` bytes starting at `offset`.
    ///
    /// Short reads only happen at end of file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on read failure.
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let file = self.file().await?;
        tokio::task::spawn_blocking(move || read_exact_at(&file, offset, length))
            .await
            .map_err(|err| AppError::Internal(format!("read task failed: {err}")))?
    }
}

impl Drop for LazyHandle {
    fn drop(&mut self) {
        self.registry.release(&self.slot);
    }
}

/// Positional read that does not move a shared cursor.
///
/// # Errors
///
/// Returns `AppError::Io` on read failure.
pub fn read_exact_at(file: &File, offset: u64, length: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; length];
    let mut filled = 0;
    while filled < length {
        let n = positional_read(file, &mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
