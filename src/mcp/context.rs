//! Per-call context handed to tool handlers.
//!
//! Bundles the shared engine with the calling session and the request's
//! cancellation token, so handlers never reach for global state.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::models::message::Notification;
use crate::models::session::Session;
use crate::stats::ServerStats;
use crate::{AppError, Result};

/// Per-request context available to every tool handler.
#[derive(Clone)]
pub struct ToolContext {
    /// Shared resource engine.
    pub engine: Arc<Engine>,
    /// Session the call arrived on.
    pub session: Arc<Session>,
    /// Cancelled by `notifications/cancelled` or session termination.
    pub cancel: CancellationToken,
    progress_token: Option<Value>,
    stats: Arc<ServerStats>,
}

impl ToolContext {
    /// Construct a new tool context.
    #[must_use]
    pub fn new(
        engine: Arc<Engine>,
        session: Arc<Session>,
        cancel: CancellationToken,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            engine,
            session,
            cancel,
            progress_token: None,
            stats,
        }
    }

    /// Attach the caller's `_meta.progressToken`.
    #[must_use]
    pub fn with_progress_token(mut self, token: Option<Value>) -> Self {
        self.progress_token = token;
        self
    }

    /// Fail fast when the call has been cancelled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` once the token fires.
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled("request cancelled".into()))
        } else {
            Ok(())
        }
    }

    /// Publish a `notifications/progress` event to the session's push
    /// stream. A no-op unless the caller supplied a progress token.
    pub fn report_progress(&self, progress: u64, total: Option<u64>) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let mut params = json!({ "progressToken": token, "progress": progress });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        self.session
            .publish(Notification::new("notifications/progress", params).to_value());
        self.stats.event();
    }
}
