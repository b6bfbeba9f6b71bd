//! Registry of live network-channel sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::models::session::{Session, TransportKind};
use crate::{AppError, Result};

/// Session counters reported by `/stats`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SessionCounters {
    /// Sessions opened since start.
    pub created: u64,
    /// Sessions removed by the idle reaper.
    pub expired: u64,
    /// Sessions terminated by the peer.
    pub terminated: u64,
    /// Sessions currently registered.
    pub active: usize,
}

/// Thread-safe map of session id to [`Session`].
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
    retention: usize,
    created: AtomicU64,
    expired: AtomicU64,
    terminated: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(idle_timeout: Duration, retention: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            retention,
            created: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            terminated: AtomicU64::new(0),
        }
    }

    /// Per-session event retention applied to new sessions.
    #[must_use]
    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Open and register a new HTTP session at `protocol_version`.
    pub fn create(&self, protocol_version: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(
            TransportKind::Http,
            protocol_version.to_owned(),
            self.retention,
        ));
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_owned(), Arc::clone(&session));
        self.created.fetch_add(1, Ordering::Relaxed);
        info!(session_id = session.id(), protocol_version, "session created");
        session
    }

    /// Resolve a live session and mark it as used.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownSession` when the id is not registered or
    /// the session has outlived its idle timeout.
    pub fn lookup(&self, id: &str) -> Result<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::UnknownSession(format!("session {id} not found")))?;
        if session.is_terminated() || session.idle_for() >= self.idle_timeout {
            return Err(AppError::UnknownSession(format!("session {id} has expired")));
        }
        session.touch();
        Ok(session)
    }

    /// Resolve a session without refreshing its idle timer.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Remove and terminate a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownSession` when the id is not registered.
    pub fn terminate(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| AppError::UnknownSession(format!("session {id} not found")))?;
        session.terminate();
        self.terminated.fetch_add(1, Ordering::Relaxed);
        info!(session_id = id, "session terminated");
        Ok(())
    }

    /// Terminate every session idle for longer than the timeout.
    ///
    /// Returns the number of sessions removed.
    pub fn reap_idle(&self) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() >= self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            session.terminate();
            info!(session_id = session.id(), "idle session reaped");
        }
        self.expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Terminate all sessions; used on shutdown.
    pub fn close_all(&self) {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in drained {
            session.terminate();
        }
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters snapshot.
    #[must_use]
    pub fn counters(&self) -> SessionCounters {
        SessionCounters {
            created: self.created.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            terminated: self.terminated.load(Ordering::Relaxed),
            active: self.len(),
        }
    }
}
