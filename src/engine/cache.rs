//! Bounded LRU cache with single-flight computation.
//!
//! A miss elects exactly one leader per key; concurrent callers for the same
//! key wait on the leader's outcome instead of recomputing. Successful
//! values are inserted under both an entry budget and a byte budget.
//! Failures are broadcast to the waiters and never stored, so the key can
//! be retried immediately. The computation belongs to the cache rather than
//! to whichever caller happened to start it.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AppError, Result};

/// Size estimate used for the byte budget.
pub trait Weigh {
    /// Approximate retained size in bytes.
    fn weight(&self) -> usize;
}

impl Weigh for Value {
    fn weight(&self) -> usize {
        estimate_json_size(self)
    }
}

impl Weigh for Vec<u8> {
    fn weight(&self) -> usize {
        self.len()
    }
}

/// Approximate serialized size of a JSON value without allocating.
#[must_use]
pub fn estimate_json_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(|v| estimate_json_size(v) + 1).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 4 + estimate_json_size(v))
                .sum::<usize>()
        }
    }
}

/// Fingerprint of an operation and its resolved inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash `operation` together with the canonical JSON form of `inputs`.
    ///
    /// Object members serialize in sorted order, so two logically equal
    /// inputs always produce the same key.
    #[must_use]
    pub fn new(operation: &str, inputs: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0]);
        hasher.update(inputs.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    /// Hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

type Outcome<V> = Option<Result<Arc<V>>>;

struct Entry<V> {
    value: Arc<V>,
    size: usize,
    tick: u64,
}

/// One running computation and the callers waiting on it.
struct Flight<V> {
    id: u64,
    outcome: watch::Receiver<Outcome<V>>,
    cancel: CancellationToken,
    participants: usize,
}

struct CacheState<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    order: BTreeMap<u64, CacheKey>,
    inflight: HashMap<CacheKey, Flight<V>>,
    used_bytes: usize,
    next_tick: u64,
    next_flight: u64,
}

impl<V> CacheState<V> {
    fn bump(&mut self, key: &CacheKey) -> Option<Arc<V>> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        self.next_tick += 1;
        Some(Arc::clone(&entry.value))
    }

    /// Least recently used entry not currently held by a reader.
    fn lru_victim(&self) -> Option<CacheKey> {
        self.order
            .values()
            .find(|key| {
                self.entries
                    .get(*key)
                    .is_some_and(|e| Arc::strong_count(&e.value) == 1)
            })
            .cloned()
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.tick);
            self.used_bytes -= entry.size;
        }
    }

    /// Remove the flight for `key` if it is still flight `id`.
    fn take_flight(&mut self, key: &CacheKey, id: u64) -> Option<Flight<V>> {
        if self.inflight.get(key).is_some_and(|flight| flight.id == id) {
            self.inflight.remove(key)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    uncached: AtomicU64,
}

/// Snapshot of cache effectiveness and occupancy.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct CacheStats {
    /// Lookups served from a retained entry.
    pub hits: u64,
    /// Lookups that ran a computation.
    pub misses: u64,
    /// Lookups that waited on another caller's computation.
    pub coalesced: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Values returned without being retained because no room was found.
    pub uncached: u64,
    /// `hits / (hits + misses + coalesced)`.
    pub hit_rate: f64,
    /// Retained entries.
    pub entries: usize,
    /// Estimated retained bytes.
    pub bytes: usize,
    /// Entry budget.
    pub max_entries: usize,
    /// Byte budget.
    pub max_bytes: usize,
}

struct CacheInner<V> {
    state: Mutex<CacheState<V>>,
    max_entries: usize,
    max_bytes: usize,
    counters: CacheCounters,
}

/// Bounded, single-flight cache of shared values.
///
/// Computations run on their own task under a token owned by the cache.
/// A caller that gives up only withdraws itself; the computation is
/// cancelled once nobody is left waiting for it.
pub struct ResourceCache<V> {
    inner: Arc<CacheInner<V>>,
}

enum Role<V> {
    Hit(Arc<V>),
    Wait(watch::Receiver<Outcome<V>>, u64),
    Lead(watch::Sender<Outcome<V>>, CancellationToken, u64),
}

impl<V> ResourceCache<V>
where
    V: Weigh + Send + Sync + 'static,
{
    /// Create an empty cache with the given budgets.
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    order: BTreeMap::new(),
                    inflight: HashMap::new(),
                    used_bytes: 0,
                    next_tick: 0,
                    next_flight: 0,
                }),
                max_entries: max_entries.max(1),
                max_bytes,
                counters: CacheCounters::default(),
            }),
        }
    }

    /// Retained value for `key`, refreshing its recency.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        let hit = self.inner.lock().bump(key);
        if hit.is_some() {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Return the cached value for `key` or compute it exactly once.
    ///
    /// On a miss `compute` is handed the computation's own token and its
    /// future is spawned; `caller` only governs how long this call waits.
    ///
    /// # Errors
    ///
    /// - The computation's error, shared by every caller waiting on it.
    /// - `AppError::Cancelled` when `caller` fires first.
    /// - `AppError::Upstream` if the computation task dies without a result.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &CacheKey,
        caller: &CancellationToken,
        compute: F,
    ) -> Result<Arc<V>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let role = {
            let mut state = self.inner.lock();
            if let Some(value) = state.bump(key) {
                Role::Hit(value)
            } else if let Some(flight) = state.inflight.get_mut(key) {
                flight.participants += 1;
                Role::Wait(flight.outcome.clone(), flight.id)
            } else {
                let (tx, rx) = watch::channel(None);
                let cancel = CancellationToken::new();
                let id = state.next_flight;
                state.next_flight += 1;
                state.inflight.insert(
                    key.clone(),
                    Flight {
                        id,
                        outcome: rx,
                        cancel: cancel.clone(),
                        participants: 1,
                    },
                );
                Role::Lead(tx, cancel, id)
            }
        };

        let (mut rx, id) = match role {
            Role::Hit(value) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            Role::Wait(rx, id) => {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "awaiting in-flight computation");
                (rx, id)
            }
            Role::Lead(tx, cancel, id) => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                let rx = tx.subscribe();
                let work = compute(cancel.clone());
                tokio::spawn(Arc::clone(&self.inner).run_flight(key.clone(), id, tx, cancel, work));
                (rx, id)
            }
        };

        let _participant = Participant {
            inner: &self.inner,
            key,
            id,
        };
        tokio::select! {
            biased;
            () = caller.cancelled() => {
                Err(AppError::Cancelled("caller stopped waiting for computation".into()))
            }
            outcome = rx.wait_for(Option::is_some) => match outcome {
                Ok(outcome) => outcome.clone().unwrap_or_else(|| {
                    Err(AppError::Internal("single-flight outcome missing".into()))
                }),
                Err(_) => Err(AppError::Upstream("computation ended without a result".into())),
            },
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.entries.clear();
        state.order.clear();
        state.used_bytes = 0;
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computations currently running.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    /// Counters and occupancy.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = {
            let state = self.inner.lock();
            (state.entries.len(), state.used_bytes)
        };
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let coalesced = counters.coalesced.load(Ordering::Relaxed);
        let lookups = hits + misses + coalesced;
        CacheStats {
            hits,
            misses,
            coalesced,
            evictions: counters.evictions.load(Ordering::Relaxed),
            uncached: counters.uncached.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries,
            bytes,
            max_entries: self.inner.max_entries,
            max_bytes: self.inner.max_bytes,
        }
    }
}

impl<V> CacheInner<V>
where
    V: Weigh + Send + Sync + 'static,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_flight<Fut>(
        self: Arc<Self>,
        key: CacheKey,
        id: u64,
        tx: watch::Sender<Outcome<V>>,
        cancel: CancellationToken,
        work: Fut,
    ) where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                Err(AppError::Cancelled("computation abandoned by every caller".into()))
            }
            result = work => result.map(Arc::new),
        };
        {
            let mut state = self.lock();
            state.take_flight(&key, id);
            if let Ok(value) = &outcome {
                self.admit(&mut state, &key, Arc::clone(value));
            }
        }
        if let Err(err) = &outcome {
            debug!(key = %key, error = %err, "computation failed; nothing cached");
        }
        tx.send_replace(Some(outcome));
    }

    /// Insert under both budgets, evicting unpinned LRU entries.
    fn admit(&self, state: &mut CacheState<V>, key: &CacheKey, value: Arc<V>) {
        let size = value.weight();
        if size > self.max_bytes {
            self.counters.uncached.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, size, "value exceeds cache byte budget; not cached");
            return;
        }
        state.remove(key);
        while state.entries.len() + 1 > self.max_entries || state.used_bytes + size > self.max_bytes
        {
            let Some(victim) = state.lru_victim() else {
                self.counters.uncached.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "all entries pinned; value returned uncached");
                return;
            };
            state.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, "evicted least recently used entry");
        }
        let tick = state.next_tick;
        state.next_tick += 1;
        state.order.insert(tick, key.clone());
        state.used_bytes += size;
        state.entries.insert(key.clone(), Entry { value, size, tick });
    }
}

/// One caller's interest in a flight; the last one out cancels it.
struct Participant<'a, V>
where
    V: Weigh + Send + Sync + 'static,
{
    inner: &'a CacheInner<V>,
    key: &'a CacheKey,
    id: u64,
}

impl<V> Drop for Participant<'_, V>
where
    V: Weigh + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let Some(flight) = state.inflight.get_mut(self.key) else {
            return;
        };
        if flight.id != self.id {
            return;
        }
        flight.participants -= 1;
        if flight.participants == 0 {
            if let Some(flight) = state.take_flight(self.key, self.id) {
                debug!(key = %self.key, "no callers left; cancelling computation");
                flight.cancel.cancel();
            }
        }
    }
}
