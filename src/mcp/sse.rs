//! Network channel: streamable HTTP with server-sent events.
//!
//! One path (default `/mcp`) accepts `POST` for client messages, `GET` for
//! the session push stream and `DELETE` to end a session. `/health` and
//! `/stats` sit beside it. An origin middleware runs before every route.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::{self, Admission, AppState, Dispatch};
use crate::config::GlobalConfig;
use crate::models::event::StreamEvent;
use crate::models::message::{Message, RequestId, Response as RpcResponse};
use crate::models::session::Session;
use crate::stats::ServerStats;
use crate::{AppError, Result};

/// Header carrying the session id.
pub const MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");
/// Header carrying the protocol revision.
pub const MCP_PROTOCOL_VERSION: HeaderName = HeaderName::from_static("mcp-protocol-version");
/// Header naming the last event a reconnecting client saw.
pub const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

const KEEP_ALIVE: Duration = Duration::from_secs(15);
const EVENT_STREAM: &str = "text/event-stream";

/// Admission for one HTTP request, derived from its headers.
struct HttpAdmission<'a> {
    state: &'a AppState,
    declared_version: Option<String>,
    session_id: Option<String>,
}

impl<'a> HttpAdmission<'a> {
    fn from_headers(state: &'a AppState, headers: &HeaderMap) -> Self {
        Self {
            state,
            declared_version: header_text(headers, &MCP_PROTOCOL_VERSION),
            session_id: header_text(headers, &MCP_SESSION_ID).filter(|id| !id.is_empty()),
        }
    }
}

impl Admission for HttpAdmission<'_> {
    fn protocol_version(&self) -> Result<String> {
        self.state.versions.resolve(self.declared_version.as_deref())
    }

    fn session(&self) -> Result<Arc<Session>> {
        let Some(id) = self.session_id.as_deref() else {
            return Err(AppError::SessionRequired(
                "Mcp-Session-Id header is required".into(),
            ));
        };
        self.state.sessions.lookup(id)
    }

    fn open_session(&self, protocol_version: &str) -> Arc<Session> {
        self.state.sessions.create(protocol_version)
    }
}

fn header_text(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).trim().to_owned())
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| {
            let media = item.split(';').next().unwrap_or("").trim();
            media.eq_ignore_ascii_case(EVENT_STREAM)
        })
}

fn is_json_body(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
}

fn json_reply(stats: &ServerStats, status: StatusCode, body: Value) -> Response {
    stats.sent();
    (status, Json(body)).into_response()
}

fn rejection(stats: &ServerStats, id: Option<RequestId>, err: &AppError) -> Response {
    stats.rejected();
    debug!(%err, status = %err.http_status(), "request rejected");
    json_reply(stats, err.http_status(), RpcResponse::failure(id, err).to_value())
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(event.payload.to_string())
}

/// Build the router for the network channel.
pub fn build_router(state: Arc<AppState>) -> Router {
    let path = state.config.http.path.clone();
    Router::new()
        .route(
            &path,
            post(post_message).get(open_stream).delete(delete_session),
        )
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), origin_gate))
        .with_state(state)
}

/// Reject requests whose `Origin` is not on the allow-list.
async fn origin_gate(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let verdict = match request.headers().get(header::ORIGIN) {
        None => Ok(()),
        Some(value) => match value.to_str() {
            Ok(origin) => state.origins.check(Some(origin)),
            Err(_) => Err(AppError::UnauthorizedOrigin("non-ASCII origin".into())),
        },
    };
    if let Err(err) = verdict {
        warn!(%err, path = %request.uri().path(), "origin rejected");
        return rejection(&state.stats, None, &err);
    }
    next.run(request).await
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_json_body(&headers) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }
    state.stats.received();
    let message = match Message::parse(&body) {
        Ok(message) => message,
        Err(failure) => return rejection(&state.stats, failure.id, &failure.error),
    };

    let admission = HttpAdmission::from_headers(&state, &headers);
    let routed = handler::route(&state, &admission, message).await;
    let opened = routed.opened.as_ref().map(|session| session.id().to_owned());

    let mut response = match routed.dispatch {
        Dispatch::Accepted => StatusCode::ACCEPTED.into_response(),
        Dispatch::Rejected { id, error } => rejection(&state.stats, id, &error),
        Dispatch::Reply(reply) => json_reply(&state.stats, StatusCode::OK, reply.to_value()),
        Dispatch::Stream(reply) if accepts_event_stream(&headers) => {
            let stats = Arc::clone(&state.stats);
            let events = reply.spawn().into_stream().map(move |event| {
                stats.sent();
                Ok::<Event, Infallible>(sse_event(&event))
            });
            Sse::new(events)
                .keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
                .into_response()
        }
        Dispatch::Stream(reply) => {
            let collected = reply.collect().await;
            json_reply(&state.stats, StatusCode::OK, collected.to_value())
        }
    };

    if let Some(id) = opened {
        match HeaderValue::from_str(&id) {
            Ok(value) => {
                response.headers_mut().insert(MCP_SESSION_ID, value);
            }
            Err(err) => warn!(%err, "session id is not a valid header value"),
        }
    }
    response
}

async fn open_stream(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !accepts_event_stream(&headers) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "Accept must include text/event-stream",
        )
            .into_response();
    }
    let admission = HttpAdmission::from_headers(&state, &headers);
    if let Err(err) = admission.protocol_version() {
        return rejection(&state.stats, None, &err);
    }
    let session = match admission.session() {
        Ok(session) => session,
        Err(err) => return rejection(&state.stats, None, &err),
    };
    let last_seen = match header_text(&headers, &LAST_EVENT_ID) {
        None => None,
        Some(raw) => match raw.parse::<u64>() {
            Ok(seq) => Some(seq),
            Err(_) => {
                let err = AppError::InvalidRequest(format!(
                    "Last-Event-ID must be a decimal sequence number, got {raw:?}"
                ));
                return rejection(&state.stats, None, &err);
            }
        },
    };

    // Subscribe before reading the log so nothing appended in between is lost.
    let watermark = session.events().subscribe();
    let replay = match last_seen {
        Some(seq) => match session.events().since(seq) {
            Ok(events) => events,
            Err(err) => return rejection(&state.stats, None, &err),
        },
        None => Vec::new(),
    };
    let generation = match session.attach_stream() {
        Ok(generation) => generation,
        Err(err) => return rejection(&state.stats, None, &err),
    };
    let delivered = replay
        .last()
        .map(|event| event.seq)
        .or(last_seen)
        .unwrap_or_else(|| session.events().latest_seq());
    session.events().acknowledge(delivered);
    info!(
        session_id = session.id(),
        generation,
        replayed = replay.len(),
        "push stream attached"
    );

    let push = PushStream {
        superseded: session.stream_generation(),
        session,
        generation,
        watermark,
        delivered,
        pending: VecDeque::new(),
        finished: false,
    };
    let live = stream::unfold(push, |mut push| async move {
        push.next_event().await.map(|event| (event, push))
    });
    let stats = Arc::clone(&state.stats);
    let events = stream::iter(replay).chain(live).map(move |event| {
        stats.sent();
        Ok::<Event, Infallible>(sse_event(&event))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
        .into_response()
}

async fn delete_session(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let admission = HttpAdmission::from_headers(&state, &headers);
    if let Err(err) = admission.protocol_version() {
        return rejection(&state.stats, None, &err);
    }
    let Some(id) = admission.session_id.as_deref() else {
        let err = AppError::SessionRequired("Mcp-Session-Id header is required".into());
        return rejection(&state.stats, None, &err);
    };
    match state.sessions.terminate(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => rejection(&state.stats, None, &err),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "transport": "http",
        "running": true,
        "sessions": state.sessions.len(),
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let engine = state.engine.stats();
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "messages": state.stats.snapshot(),
        "sessions": state.sessions.counters(),
        "cache": engine.cache,
        "pool": engine.pool,
        "handles": engine.handles,
        "uptimeSeconds": uptime,
        "startedAt": state.started_at.to_rfc3339(),
    }))
}

/// Live half of a push stream: forwards push-origin events, and reply
/// events whose own stream has detached, as the log's watermark advances.
/// Ends when superseded, or after draining once the session terminates.
struct PushStream {
    session: Arc<Session>,
    generation: u64,
    watermark: watch::Receiver<u64>,
    superseded: watch::Receiver<u64>,
    delivered: u64,
    pending: VecDeque<Arc<StreamEvent>>,
    finished: bool,
}

impl PushStream {
    async fn next_event(&mut self) -> Option<Arc<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished || !self.session.is_current_stream(self.generation) {
                return None;
            }
            if self.session.is_terminated() {
                self.finished = true;
                self.refill();
                continue;
            }
            let session = Arc::clone(&self.session);
            tokio::select! {
                biased;
                () = session.cancellation().cancelled() => {}
                changed = self.superseded.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                changed = self.watermark.changed() => {
                    if changed.is_err() {
                        self.finished = true;
                    }
                }
            }
            self.refill();
        }
    }

    fn refill(&mut self) {
        self.watermark.borrow_and_update();
        match self.session.events().since(self.delivered) {
            Ok(events) => {
                if let Some(last) = events.last() {
                    self.delivered = last.seq;
                    self.session.events().acknowledge(last.seq);
                }
                let session = &self.session;
                self.pending
                    .extend(events.into_iter().filter(|event| session.pushes(event)));
            }
            Err(err) => {
                warn!(session_id = self.session.id(), %err, "push stream fell behind");
                self.delivered = self.session.events().latest_seq();
            }
        }
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        self.session.detach_stream(self.generation);
        debug!(
            session_id = self.session.id(),
            generation = self.generation,
            "push stream detached"
        );
    }
}

/// Serve the network channel on an already-bound listener.
///
/// On cancellation every session is closed so open push streams drain and
/// the server can finish its graceful shutdown.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve_http_on(
    listener: TcpListener,
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, path = %state.config.http.path, "starting HTTP transport");

    let sessions = Arc::clone(&state.sessions);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
            sessions.close_all();
        })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("HTTP transport shut down");
    Ok(())
}

/// Bind the configured address after the loopback policy is applied.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind.
pub async fn bind_listener(config: &GlobalConfig) -> Result<TcpListener> {
    let host = config.bind_host();
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = config.http.port;
    TcpListener::bind((host, port))
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {host}:{port}: {err}")))
}
