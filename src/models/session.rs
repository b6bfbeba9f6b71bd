//! Session model and push-stream lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::event::{EventKind, EventOrigin, StreamEvent};
use crate::models::message::RequestId;
use crate::session::event_log::EventLog;
use crate::{AppError, Result};

/// Identifier of the implicit local-channel session.
pub const LOCAL_SESSION_ID: &str = "local";

/// Transport that owns a session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Newline-delimited stdio.
    Stdio,
    /// Streamable HTTP.
    Http,
}

/// Push-stream state for one session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No push stream attached.
    Idle,
    /// A push stream is delivering events.
    Streaming,
    /// Session terminated; the stream flushes retained events then ends.
    Draining,
    /// Session terminated and its stream finished.
    Closed,
}

#[derive(Debug)]
struct StreamSlot {
    state: StreamState,
    generation: u64,
}

/// Server-side state binding one peer across requests.
#[derive(Debug)]
pub struct Session {
    id: String,
    transport: TransportKind,
    created_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    protocol_version: Mutex<String>,
    events: EventLog,
    stream: Mutex<StreamSlot>,
    generation: watch::Sender<u64>,
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
    followed: Mutex<HashSet<RequestId>>,
    cancel: CancellationToken,
}

impl Session {
    /// Construct a session with a fresh unguessable identifier.
    #[must_use]
    pub fn new(transport: TransportKind, protocol_version: String, retention: usize) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), transport, protocol_version, retention)
    }

    /// The implicit session owned by the local channel for its lifetime.
    #[must_use]
    pub fn local(protocol_version: String, retention: usize) -> Self {
        Self::with_id(
            LOCAL_SESSION_ID.to_owned(),
            TransportKind::Stdio,
            protocol_version,
            retention,
        )
    }

    fn with_id(
        id: String,
        transport: TransportKind,
        protocol_version: String,
        retention: usize,
    ) -> Self {
        Self {
            id,
            transport,
            created_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            protocol_version: Mutex::new(protocol_version),
            events: EventLog::new(retention),
            stream: Mutex::new(StreamSlot {
                state: StreamState::Idle,
                generation: 0,
            }),
            generation: watch::Sender::new(0),
            inflight: Mutex::new(HashMap::new()),
            followed: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Opaque session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning transport.
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Negotiated protocol revision.
    #[must_use]
    pub fn protocol_version(&self) -> String {
        self.protocol_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record the revision agreed during `initialize`.
    pub fn set_protocol_version(&self, version: &str) {
        version.clone_into(&mut self.protocol_version.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Mark the session as used now.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last request on this session.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// The session's event log.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Append a session-level notification for the push stream.
    pub fn publish(&self, payload: Value) -> Arc<StreamEvent> {
        self.events
            .append(EventKind::Message, EventOrigin::Push, payload)
    }

    /// Token cancelled when the session terminates.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the session has been terminated.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register `id` as in flight.
    ///
    /// The returned guard releases the id when dropped, so a response for a
    /// given id is produced at most once while the request is running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidRequest` when the same id is already in
    /// flight on this session.
    pub fn begin_request(self: &Arc<Self>, id: &RequestId) -> Result<InflightGuard> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.contains_key(id) {
            return Err(AppError::InvalidRequest(format!(
                "request id {id} is already in flight"
            )));
        }
        let token = self.cancel.child_token();
        inflight.insert(id.clone(), token.clone());
        Ok(InflightGuard {
            session: Arc::clone(self),
            id: id.clone(),
            token,
        })
    }

    /// Signal cancellation to an in-flight request. Returns whether it was found.
    pub fn cancel_request(&self, id: &RequestId) -> bool {
        let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        inflight.get(id).is_some_and(|token| {
            token.cancel();
            true
        })
    }

    /// Number of requests currently in flight.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Mark the streamed reply to `id` as delivered by its own stream.
    pub fn follow_reply(&self, id: &RequestId) {
        self.followed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
    }

    /// The reply stream for `id` went away; the push stream takes over.
    pub fn unfollow_reply(&self, id: &RequestId) {
        self.followed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Whether the reply to `id` still has a stream of its own.
    #[must_use]
    pub fn is_reply_followed(&self, id: &RequestId) -> bool {
        self.followed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Whether the push stream should carry `event`: session notifications
    /// always, reply events only once their own stream has gone.
    #[must_use]
    pub fn pushes(&self, event: &StreamEvent) -> bool {
        match (&event.origin, &event.request) {
            (EventOrigin::Push, _) => true,
            (EventOrigin::Request, Some(id)) => !self.is_reply_followed(id),
            (EventOrigin::Request, None) => false,
        }
    }

    /// Current push-stream state.
    #[must_use]
    pub fn stream_state(&self) -> StreamState {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Attach a new push stream, superseding any previous one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownSession` once the session has terminated.
    pub fn attach_stream(&self) -> Result<u64> {
        let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slot.state, StreamState::Draining | StreamState::Closed) {
            return Err(AppError::UnknownSession(format!("session {} is closed", self.id)));
        }
        slot.generation += 1;
        slot.state = StreamState::Streaming;
        self.generation.send_replace(slot.generation);
        Ok(slot.generation)
    }

    /// Whether `generation` is still the attached stream.
    #[must_use]
    pub fn is_current_stream(&self, generation: u64) -> bool {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
            == generation
    }

    /// Watch that changes whenever a newer push stream attaches.
    #[must_use]
    pub fn stream_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Called by a push stream when it stops delivering.
    pub fn detach_stream(&self, generation: u64) {
        let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation != generation {
            return;
        }
        slot.state = match slot.state {
            StreamState::Streaming => StreamState::Idle,
            StreamState::Draining | StreamState::Closed => StreamState::Closed,
            StreamState::Idle => StreamState::Idle,
        };
    }

    /// Terminate the session: cancel in-flight work and move an attached
    /// stream into draining.
    pub fn terminate(&self) {
        {
            let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
            slot.state = match slot.state {
                StreamState::Streaming => StreamState::Draining,
                StreamState::Idle | StreamState::Draining | StreamState::Closed => {
                    StreamState::Closed
                }
            };
        }
        self.cancel.cancel();
    }
}

/// Releases an in-flight request id on drop.
pub struct InflightGuard {
    session: Arc<Session>,
    id: RequestId,
    token: CancellationToken,
}

impl InflightGuard {
    /// Cancellation signal for this request.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.session
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
