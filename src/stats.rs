//! Process-wide counters surfaced by the `/stats` endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic transport counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    requests_rejected: AtomicU64,
    errors: AtomicU64,
    events_emitted: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MessageCounters {
    /// Inbound messages parsed (including malformed ones).
    pub messages_received: u64,
    /// Outbound messages written to any transport.
    pub messages_sent: u64,
    /// Requests refused by a validation gate.
    pub requests_rejected: u64,
    /// Tool failures and transport faults.
    pub errors: u64,
    /// Stream events appended to session logs.
    pub events_emitted: u64,
}

impl ServerStats {
    /// Record one inbound message.
    pub fn received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one outbound message.
    pub fn sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request refused before dispatch.
    pub fn rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure after dispatch.
    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an appended stream event.
    pub fn event(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MessageCounters {
        MessageCounters {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
        }
    }
}
