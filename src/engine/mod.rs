//! Resource-access engine shared by every transport.

pub mod cache;
pub mod emitter;
pub mod lazy;
pub mod path_safety;
pub mod pool;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use self::cache::{CacheStats, ResourceCache};
use self::emitter::Emitter;
use self::lazy::{HandleRegistry, HandleStats};
use self::pool::{PoolStats, WorkerPool};
use crate::config::GlobalConfig;
use crate::Result;

/// Cache, handles, pool and emitter bound to one data root.
pub struct Engine {
    data_root: PathBuf,
    /// Computed tool results.
    pub cache: ResourceCache<Value>,
    /// Shared lazy file handles.
    pub handles: Arc<HandleRegistry>,
    /// Blocking work pool.
    pub pool: WorkerPool,
    /// Inline/chunked delivery policy.
    pub emitter: Emitter,
}

/// Engine section of `/stats`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct EngineStats {
    /// Cache counters.
    pub cache: CacheStats,
    /// Pool counters.
    pub pool: PoolStats,
    /// Handle counters.
    pub handles: HandleStats,
}

impl Engine {
    /// Build the engine described by `config`.
    #[must_use]
    pub fn new(config: &GlobalConfig) -> Self {
        Self {
            data_root: config.data_root.clone(),
            cache: ResourceCache::new(config.cache.max_entries, config.cache.max_bytes),
            handles: Arc::new(HandleRegistry::new()),
            pool: WorkerPool::new(&config.pool),
            emitter: Emitter::new(&config.streaming),
        }
    }

    /// Canonical data root.
    #[must_use]
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Resolve a tool-supplied path inside the data root.
    ///
    /// # Errors
    ///
    /// See [`path_safety::resolve_within`].
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf> {
        path_safety::resolve_within(&self.data_root, candidate)
    }

    /// Path relative to the data root, for output.
    #[must_use]
    pub fn relative(&self, path: &Path) -> String {
        path_safety::display_relative(&self.data_root, path)
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cache: self.cache.stats(),
            pool: self.pool.stats(),
            handles: self.handles.stats(),
        }
    }
}
