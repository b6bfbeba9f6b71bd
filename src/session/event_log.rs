//! Bounded, ordered log of stream events for one session.
//!
//! The log is the single source of truth for both replay and live
//! delivery: appends advance a sequence watermark that push streams follow,
//! so a stream never depends on which connection an event was first
//! written to.
//!
//! Readers acknowledge how far they have read. Producers of streamed
//! replies wait for room below [`EventLog::high_water`] so an unread event
//! is not evicted by the reply that follows it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use crate::models::event::{EventKind, EventOrigin, StreamEvent};
use crate::models::message::RequestId;
use crate::{AppError, Result};

#[derive(Debug)]
struct LogInner {
    events: VecDeque<Arc<StreamEvent>>,
    next_seq: u64,
}

/// Per-session event buffer retaining the most recent `capacity` events.
#[derive(Debug)]
pub struct EventLog {
    inner: Mutex<LogInner>,
    capacity: usize,
    watermark: watch::Sender<u64>,
    acked: watch::Sender<u64>,
}

impl EventLog {
    /// Create an empty log. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (watermark, _) = watch::channel(0);
        let (acked, _) = watch::channel(0);
        Self {
            inner: Mutex::new(LogInner {
                events: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 1,
            }),
            capacity: capacity.max(1),
            watermark,
            acked,
        }
    }

    /// Append an event, evicting the oldest when over capacity.
    pub fn append(&self, kind: EventKind, origin: EventOrigin, payload: Value) -> Arc<StreamEvent> {
        self.push(kind, origin, None, payload)
    }

    /// Append one event of the streamed reply to `id`.
    pub fn append_reply(&self, kind: EventKind, id: &RequestId, payload: Value) -> Arc<StreamEvent> {
        self.push(kind, EventOrigin::Request, Some(id.clone()), payload)
    }

    fn push(
        &self,
        kind: EventKind,
        origin: EventOrigin,
        request: Option<RequestId>,
        payload: Value,
    ) -> Arc<StreamEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let event = Arc::new(StreamEvent {
            seq: inner.next_seq,
            kind,
            origin,
            request,
            payload,
        });
        inner.next_seq += 1;
        inner.events.push_back(Arc::clone(&event));
        while inner.events.len() > self.capacity {
            inner.events.pop_front();
        }
        // Published under the lock so the watermark never moves backwards.
        self.watermark.send_replace(event.seq);
        event
    }

    /// Every retained event with `seq > last_seen`, in order.
    ///
    /// # Errors
    ///
    /// - `AppError::ResumptionGap` when event `last_seen + 1` has already
    ///   been evicted.
    /// - `AppError::InvalidRequest` when `last_seen` is beyond the newest
    ///   event ever appended.
    pub fn since(&self, last_seen: u64) -> Result<Vec<Arc<StreamEvent>>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let latest = inner.next_seq - 1;
        if last_seen > latest {
            return Err(AppError::InvalidRequest(format!(
                "last event id {last_seen} is ahead of the log (latest {latest})"
            )));
        }
        let Some(oldest) = inner.events.front().map(|e| e.seq) else {
            return Ok(Vec::new());
        };
        if last_seen + 1 < oldest {
            return Err(AppError::ResumptionGap { last_seen, oldest });
        }
        let skip = usize::try_from((last_seen + 1).saturating_sub(oldest)).unwrap_or(usize::MAX);
        Ok(inner.events.iter().skip(skip).cloned().collect())
    }

    /// Sequence number of the newest appended event, 0 when empty.
    #[must_use]
    pub fn latest_seq(&self) -> u64 {
        *self.watermark.borrow()
    }

    /// Sequence number of the oldest retained event.
    #[must_use]
    pub fn oldest_seq(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.events.front().map(|e| e.seq)
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.events.len()
    }

    /// Whether nothing has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver that wakes whenever the watermark advances.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.watermark.subscribe()
    }

    /// Record that some reader has consumed every event up to `seq`.
    pub fn acknowledge(&self, seq: u64) {
        self.acked.send_if_modified(|acked| {
            if seq > *acked {
                *acked = seq;
                true
            } else {
                false
            }
        });
    }

    /// Highest sequence number any reader has acknowledged.
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        *self.acked.borrow()
    }

    /// Unread events a reply producer may leave behind before it pauses.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        let capacity = u64::try_from(self.capacity).unwrap_or(u64::MAX);
        (capacity - capacity / 4).max(1)
    }

    /// Wait until fewer than `limit` appended events lie beyond both the
    /// acknowledged position and `floor`, a position the caller already
    /// knows was read.
    pub async fn wait_for_room(&self, limit: u64, floor: u64) {
        let mut acked = self.acked.subscribe();
        let _ = acked
            .wait_for(|acked| self.latest_seq().saturating_sub((*acked).max(floor)) < limit)
            .await;
    }
}
