//! Protocol router, shared application state, and streamed replies.
//!
//! The router owns the request validation pipeline. Checks run in a fixed
//! order and the first failure short-circuits:
//!
//! 1. envelope (done by the transport when it parses the message);
//! 2. known method, including the tool name for `tools/call`;
//! 3. protocol revision;
//! 4. session;
//! 5. typed parameters.
//!
//! Steps 3 and 4 are transport specific and are supplied through the
//! [`Admission`] trait, so the router never knows which channel it serves.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use super::context::ToolContext;
use super::origin::OriginPolicy;
use super::tools::{call_result, ToolRegistry};
use super::version::VersionPolicy;
use crate::config::GlobalConfig;
use crate::engine::emitter::{Emission, Frame};
use crate::engine::Engine;
use crate::models::event::{EventKind, StreamEvent};
use crate::models::message::{Message, Notification, Request, RequestId, Response};
use crate::models::session::{InflightGuard, Session};
use crate::session::event_log::EventLog;
use crate::session::registry::SessionRegistry;
use crate::stats::ServerStats;
use crate::{AppError, Result};

/// Method opening a session.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Liveness check.
pub const METHOD_PING: &str = "ping";
/// Tool catalogue.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Tool invocation.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Notification carrying one chunk of a streamed result.
pub const NOTIFICATION_CHUNK: &str = "notifications/chunk";
/// Client notification cancelling an in-flight request.
pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
/// Client notification completing the handshake.
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";

const KNOWN_METHODS: &[&str] = &[
    METHOD_INITIALIZE,
    METHOD_PING,
    METHOD_TOOLS_LIST,
    METHOD_TOOLS_CALL,
];

/// Shared application state accessible by both transports.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Live network sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Resource engine.
    pub engine: Arc<Engine>,
    /// Registered tools.
    pub tools: ToolRegistry,
    /// Protocol revision policy.
    pub versions: VersionPolicy,
    /// Origin allow-list for the network channel.
    pub origins: OriginPolicy,
    /// Transport counters.
    pub stats: Arc<ServerStats>,
    /// Process start time.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build state with the built-in tools.
    #[must_use]
    pub fn new(config: GlobalConfig) -> Arc<Self> {
        Self::with_tools(config, ToolRegistry::builtin())
    }

    /// Build state with a custom tool registry.
    #[must_use]
    pub fn with_tools(config: GlobalConfig, tools: ToolRegistry) -> Arc<Self> {
        let sessions = Arc::new(SessionRegistry::new(
            std::time::Duration::from_secs(config.sessions.idle_timeout_seconds),
            config.sessions.event_retention,
        ));
        Arc::new(Self {
            engine: Arc::new(Engine::new(&config)),
            versions: VersionPolicy::new(&config.protocol),
            origins: OriginPolicy::new(&config.security.allowed_origins),
            config: Arc::new(config),
            sessions,
            tools,
            stats: Arc::new(ServerStats::default()),
            started_at: Utc::now(),
        })
    }
}

/// Transport-supplied validation steps.
pub trait Admission: Send + Sync {
    /// Protocol revision the request is made under.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnsupportedVersion` for an unknown revision.
    fn protocol_version(&self) -> Result<String>;

    /// Session the request belongs to.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionRequired` or `AppError::UnknownSession`.
    fn session(&self) -> Result<Arc<Session>>;

    /// Open the session for a successful `initialize`.
    fn open_session(&self, protocol_version: &str) -> Arc<Session>;
}

/// Router verdict for one inbound message.
pub enum Dispatch {
    /// One complete response.
    Reply(Response),
    /// Refused by a validation gate before any tool ran.
    Rejected {
        /// Id of the offending request, when known.
        id: Option<RequestId>,
        /// Why it was refused.
        error: AppError,
    },
    /// Chunk events followed by a final response.
    Stream(StreamedReply),
    /// Notification or client response; nothing to send back.
    Accepted,
}

impl Dispatch {
    fn reject(id: Option<RequestId>, error: AppError) -> Self {
        Self::Rejected { id, error }
    }
}

/// Routed message plus the session an `initialize` opened.
pub struct Routed {
    /// What to send back.
    pub dispatch: Dispatch,
    /// Session created by this message, if any.
    pub opened: Option<Arc<Session>>,
}

impl From<Dispatch> for Routed {
    fn from(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            opened: None,
        }
    }
}

/// A chunked tool result bound to the session whose log records it.
pub struct StreamedReply {
    id: RequestId,
    session: Arc<Session>,
    frames: BoxStream<'static, Frame>,
    guard: InflightGuard,
    stats: Arc<ServerStats>,
}

impl StreamedReply {
    /// Request this reply answers.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Run the reply on its own task and return a follower positioned just
    /// before its first event.
    ///
    /// The task records every frame in the session log and keeps the
    /// request id in flight until the final event is logged, whether or not
    /// the follower is still being read. It pauses while its reader is
    /// [`EventLog::high_water`] events behind; once the follower is dropped
    /// the session push stream becomes that reader.
    pub fn spawn(self) -> ReplyFollower {
        let start = self.session.events().latest_seq();
        let (read_tx, read_rx) = watch::channel(start);
        let follower = ReplyFollower::new(Arc::clone(&self.session), self.id.clone(), read_tx);
        tokio::spawn(self.produce(read_rx));
        follower
    }

    async fn produce(self, mut reader: watch::Receiver<u64>) {
        let Self {
            id,
            session,
            mut frames,
            guard,
            stats,
        } = self;
        let log = session.events();
        let limit = log.high_water();
        let mut logged = 0_usize;
        loop {
            let next = async {
                wait_for_reader(log, &mut reader, limit).await;
                frames.next().await
            };
            let frame = tokio::select! {
                biased;
                () = guard.token().cancelled() => {
                    Frame::Failed(AppError::Cancelled("request cancelled".into()))
                }
                frame = next => frame.unwrap_or_else(|| {
                    Frame::Failed(AppError::Internal("result stream ended early".into()))
                }),
            };
            let (kind, payload) = frame_message(&id, frame);
            if kind == EventKind::Error {
                stats.error();
            }
            log.append_reply(kind, &id, payload);
            stats.event();
            logged += 1;
            if kind != EventKind::Chunk {
                break;
            }
        }
        drop(guard);
        debug!(
            session_id = session.id(),
            request_id = %id,
            events = logged,
            "streamed reply logged"
        );
    }

    /// Collapse the frames into one response for peers that cannot take a
    /// stream. Nothing is recorded in the event log.
    pub async fn collect(self) -> Response {
        let Self {
            id, frames, guard, stats, ..
        } = self;
        let outcome = Emission::Chunked(frames).into_value().await;
        drop(guard);
        match outcome {
            Ok(value) => Response::success(id, call_result(value)),
            Err(err) => {
                stats.error();
                Response::failure(Some(id), &err)
            }
        }
    }
}

/// Wait until the reply's reader is less than `limit` events behind the
/// log. A closed `reader` means the follower is gone; from its last
/// position on, the push stream's acknowledgements govern.
async fn wait_for_reader(log: &EventLog, reader: &mut watch::Receiver<u64>, limit: u64) {
    let followed = reader
        .wait_for(|read| log.latest_seq().saturating_sub(*read) < limit)
        .await
        .is_ok();
    if !followed {
        let floor = *reader.borrow();
        log.wait_for_room(limit, floor).await;
    }
}

/// Reader of one streamed reply.
///
/// Follows the session log by sequence number, yields the events of its
/// reply in order and ends after the final response. Dropping it hands the
/// rest of the reply to the session push stream.
pub struct ReplyFollower {
    id: RequestId,
    session: Arc<Session>,
    watermark: watch::Receiver<u64>,
    read: watch::Sender<u64>,
    cursor: u64,
    pending: VecDeque<Arc<StreamEvent>>,
    done: bool,
}

impl ReplyFollower {
    fn new(session: Arc<Session>, id: RequestId, read: watch::Sender<u64>) -> Self {
        let watermark = session.events().subscribe();
        let cursor = *read.borrow();
        session.follow_reply(&id);
        Self {
            id,
            session,
            watermark,
            read,
            cursor,
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Request being followed.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Next event of the reply; `None` after the final response, or when
    /// the reply fell out of the log before it could be read.
    pub async fn next_event(&mut self) -> Option<Arc<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.ends_reply_to(&self.id) {
                    self.done = true;
                }
                return Some(event);
            }
            if self.done {
                return None;
            }
            self.watermark.borrow_and_update();
            match self.session.events().since(self.cursor) {
                Ok(events) => {
                    if let Some(last) = events.last() {
                        self.cursor = last.seq;
                        self.read.send_replace(last.seq);
                    }
                    let id = &self.id;
                    self.pending
                        .extend(events.into_iter().filter(|e| e.request.as_ref() == Some(id)));
                    if !self.pending.is_empty() {
                        continue;
                    }
                }
                Err(err) => {
                    warn!(
                        session_id = self.session.id(),
                        request_id = %self.id,
                        %err,
                        "reply follower fell behind"
                    );
                    self.done = true;
                    return None;
                }
            }
            if self.watermark.changed().await.is_err() {
                self.done = true;
            }
        }
    }

    /// The follower as a stream of events.
    pub fn into_stream(self) -> BoxStream<'static, Arc<StreamEvent>> {
        stream::unfold(self, |mut follower| async move {
            follower.next_event().await.map(|event| (event, follower))
        })
        .boxed()
    }
}

impl Drop for ReplyFollower {
    fn drop(&mut self) {
        self.session.unfollow_reply(&self.id);
        if !self.done {
            debug!(
                session_id = self.session.id(),
                request_id = %self.id,
                "reply stream detached before completion"
            );
        }
    }
}

fn frame_message(id: &RequestId, frame: Frame) -> (EventKind, Value) {
    match frame {
        Frame::Chunk { index, items } => (
            EventKind::Chunk,
            Notification::new(
                NOTIFICATION_CHUNK,
                json!({ "requestId": id, "index": index, "items": items }),
            )
            .to_value(),
        ),
        Frame::End {
            total_items,
            chunks,
            trailer,
        } => (
            EventKind::End,
            Response::success(
                id.clone(),
                call_result(Frame::end_result(total_items, chunks, &trailer)),
            )
            .to_value(),
        ),
        Frame::Failed(err) => (
            EventKind::Error,
            Response::failure(Some(id.clone()), &err).to_value(),
        ),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    client_info: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default, rename = "_meta")]
    meta: Option<CallMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallMeta {
    #[serde(default)]
    progress_token: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: RequestId,
    #[serde(default)]
    reason: Option<String>,
}

fn typed_params<T: for<'de> Deserialize<'de>>(method: &str, params: Option<Value>) -> Result<T> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|err| AppError::InvalidParams(format!("{method}: {err}")))
}

/// Route one parsed message.
pub async fn route(state: &Arc<AppState>, admission: &dyn Admission, message: Message) -> Routed {
    match message {
        Message::Request(request) => {
            let span = info_span!("request", id = %request.id, method = %request.method);
            route_request(state, admission, request)
                .instrument(span)
                .await
        }
        Message::Notification(notification) => {
            route_notification(admission, notification);
            Dispatch::Accepted.into()
        }
        Message::Response(response) => {
            debug!(id = ?response.id, "ignoring client response");
            Dispatch::Accepted.into()
        }
    }
}

fn route_notification(admission: &dyn Admission, notification: Notification) {
    match notification.method.as_str() {
        NOTIFICATION_CANCELLED => {
            let params: Result<CancelledParams> =
                typed_params(NOTIFICATION_CANCELLED, notification.params);
            match (params, admission.session()) {
                (Ok(params), Ok(session)) => {
                    let found = session.cancel_request(&params.request_id);
                    info!(
                        request_id = %params.request_id,
                        reason = params.reason.as_deref().unwrap_or(""),
                        found,
                        "cancellation requested"
                    );
                }
                (Err(err), _) | (_, Err(err)) => {
                    debug!(%err, "ignoring cancellation notification");
                }
            }
        }
        NOTIFICATION_INITIALIZED => debug!("client initialized"),
        other => debug!(method = other, "ignoring notification"),
    }
}

async fn route_request(
    state: &Arc<AppState>,
    admission: &dyn Admission,
    request: Request,
) -> Routed {
    let Request { id, method, params } = request;

    // 2. known method
    if !KNOWN_METHODS.contains(&method.as_str()) {
        return Dispatch::reject(Some(id), AppError::UnknownMethod(method)).into();
    }
    if method == METHOD_TOOLS_CALL {
        if let Some(name) = params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
        {
            if !state.tools.contains(name) {
                return Dispatch::reject(
                    Some(id),
                    AppError::UnknownMethod(format!("tool {name} is not registered")),
                )
                .into();
            }
        }
    }

    // 3. protocol revision
    let version = match admission.protocol_version() {
        Ok(version) => version,
        Err(err) => return Dispatch::reject(Some(id), err).into(),
    };

    if method == METHOD_INITIALIZE {
        return initialize(state, admission, id, params);
    }

    // 4. session
    let session = match admission.session() {
        Ok(session) => session,
        Err(err) => return Dispatch::reject(Some(id), err).into(),
    };
    debug!(session_id = session.id(), %version, "request admitted");

    match method.as_str() {
        METHOD_PING => Dispatch::Reply(Response::success(id, json!({}))).into(),
        METHOD_TOOLS_LIST => {
            let tools = state.tools.descriptors();
            Dispatch::Reply(Response::success(id, json!({ "tools": tools }))).into()
        }
        _ => call_tool(state, session, id, params).await.into(),
    }
}

fn initialize(
    state: &Arc<AppState>,
    admission: &dyn Admission,
    id: RequestId,
    params: Option<Value>,
) -> Routed {
    let params: InitializeParams = match typed_params(METHOD_INITIALIZE, params) {
        Ok(params) => params,
        Err(err) => return Dispatch::reject(Some(id), err).into(),
    };
    let negotiated = match state.versions.resolve(params.protocol_version.as_deref()) {
        Ok(version) => version,
        Err(err) => return Dispatch::reject(Some(id), err).into(),
    };
    let session = admission.open_session(&negotiated);
    info!(
        session_id = session.id(),
        protocol_version = %negotiated,
        client = ?params.client_info,
        "initialize accepted"
    );
    let result = json!({
        "protocolVersion": negotiated,
        "capabilities": {
            "tools": { "listChanged": false },
            "experimental": {
                "chunkedResults": { "notification": NOTIFICATION_CHUNK }
            }
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "instructions": "Read-only access to files under the configured data root."
    });
    Routed {
        dispatch: Dispatch::Reply(Response::success(id, result)),
        opened: Some(session),
    }
}

async fn call_tool(
    state: &Arc<AppState>,
    session: Arc<Session>,
    id: RequestId,
    params: Option<Value>,
) -> Dispatch {
    // 5. typed parameters
    let params: CallToolParams = match typed_params(METHOD_TOOLS_CALL, params) {
        Ok(params) => params,
        Err(err) => return Dispatch::reject(Some(id), err),
    };
    let call = match state.tools.prepare(&params.name, params.arguments) {
        Ok(call) => call,
        Err(err) => return Dispatch::reject(Some(id), err),
    };

    let guard = match session.begin_request(&id) {
        Ok(guard) => guard,
        Err(err) => return Dispatch::reject(Some(id), err),
    };
    let ctx = ToolContext::new(
        Arc::clone(&state.engine),
        Arc::clone(&session),
        guard.token().clone(),
        Arc::clone(&state.stats),
    )
    .with_progress_token(params.meta.and_then(|m| m.progress_token));

    let span = info_span!("tool", tool = %params.name);
    let planned = async {
        let output = call(ctx).await?;
        state.engine.emitter.plan(output).await
    }
    .instrument(span)
    .await;

    match planned {
        Ok(Emission::Inline(value)) => Dispatch::Reply(Response::success(id, call_result(value))),
        Ok(Emission::Chunked(frames)) => Dispatch::Stream(StreamedReply {
            id,
            session,
            frames,
            guard,
            stats: Arc::clone(&state.stats),
        }),
        Err(err) => {
            warn!(tool = %params.name, %err, "tool call failed");
            state.stats.error();
            Dispatch::Reply(Response::failure(Some(id), &err))
        }
    }
}
