//! Local channel: newline-delimited JSON-RPC over a byte stream.
//!
//! Requests are dispatched concurrently up to `stdio.max_inflight`. A single
//! writer task owns the output half, so frames never interleave and
//! responses appear in completion order. Session-level push events are
//! forwarded as they land in the local session's log.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{Inbound, LineCodec};
use super::handler::{self, Admission, AppState, Dispatch};
use crate::models::message::{Message, Response};
use crate::models::session::Session;
use crate::stats::ServerStats;
use crate::Result;

const OUTBOUND_BUFFER: usize = 256;

/// Admission for the single anonymous local session.
struct LocalAdmission {
    session: Arc<Session>,
}

impl Admission for LocalAdmission {
    fn protocol_version(&self) -> Result<String> {
        Ok(self.session.protocol_version())
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session.touch();
        Ok(Arc::clone(&self.session))
    }

    fn open_session(&self, protocol_version: &str) -> Arc<Session> {
        self.session.set_protocol_version(protocol_version);
        Arc::clone(&self.session)
    }
}

/// Serve the local channel on stdin/stdout until EOF or cancellation.
///
/// # Errors
///
/// Returns `AppError::Io` if stdout can no longer be written.
pub async fn serve_stdio(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    info!("starting stdio transport");
    let outcome = serve_lines(state, tokio::io::stdin(), tokio::io::stdout(), ct).await;
    info!("stdio transport shut down");
    outcome
}

/// Serve the local channel over an arbitrary reader/writer pair.
///
/// Returns once the reader reaches EOF and every in-flight request has
/// been answered, or promptly after `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the writer fails.
pub async fn serve_lines<R, W>(
    state: Arc<AppState>,
    reader: R,
    writer: W,
    ct: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let session = Arc::new(Session::local(
        state.versions.default_version().to_owned(),
        state.config.sessions.event_retention,
    ));
    let admission = Arc::new(LocalAdmission {
        session: Arc::clone(&session),
    });

    let (tx, rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(write_loop(writer, rx, Arc::clone(&state.stats)));
    let forwarder = tokio::spawn(forward_push(
        Arc::clone(&session),
        tx.clone(),
        session.cancellation().clone(),
    ));

    let max_inflight = state.config.stdio.max_inflight;
    let limiter = Arc::new(Semaphore::new(max_inflight));
    let mut lines = FramedRead::new(reader, LineCodec::new());

    loop {
        let next = tokio::select! {
            biased;
            () = ct.cancelled() => break,
            next = lines.next() => next,
        };
        let inbound = match next {
            None => {
                debug!("stdin closed");
                break;
            }
            Some(Err(err)) => {
                warn!(%err, "stdin read failed");
                break;
            }
            Some(Ok(inbound)) => inbound,
        };

        let line = match inbound {
            Inbound::Line(line) if line.trim().is_empty() => continue,
            Inbound::Line(line) => line,
            Inbound::Rejected(err) => {
                state.stats.received();
                state.stats.rejected();
                send(&tx, Response::failure(None, &err).to_value()).await;
                continue;
            }
        };
        state.stats.received();

        let message = match Message::parse(line.as_bytes()) {
            Ok(message) => message,
            Err(failure) => {
                debug!(error = %failure.error, "malformed message");
                state.stats.rejected();
                send(&tx, Response::failure(failure.id, &failure.error).to_value()).await;
                continue;
            }
        };

        let permit = tokio::select! {
            biased;
            () = ct.cancelled() => break,
            permit = Arc::clone(&limiter).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let state = Arc::clone(&state);
        let admission = Arc::clone(&admission);
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_message(&state, admission.as_ref(), message, &tx).await;
        });
    }

    if ct.is_cancelled() {
        session.terminate();
    }
    // Every permit back means every dispatched request has been answered.
    let all = u32::try_from(max_inflight).unwrap_or(u32::MAX);
    let _drained = limiter.acquire_many(all).await;
    session.terminate();

    drop(tx);
    let _ = forwarder.await;
    match writer_task.await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(%err, "stdio writer task panicked");
            Ok(())
        }
    }
}

async fn handle_message(
    state: &Arc<AppState>,
    admission: &LocalAdmission,
    message: Message,
    tx: &mpsc::Sender<Value>,
) {
    let routed = handler::route(state, admission, message).await;
    match routed.dispatch {
        Dispatch::Reply(response) => send(tx, response.to_value()).await,
        Dispatch::Rejected { id, error } => {
            state.stats.rejected();
            send(tx, Response::failure(id, &error).to_value()).await;
        }
        Dispatch::Stream(reply) => {
            let mut follower = reply.spawn();
            while let Some(event) = follower.next_event().await {
                send(tx, event.payload.clone()).await;
            }
        }
        Dispatch::Accepted => {}
    }
}

async fn send(tx: &mpsc::Sender<Value>, message: Value) {
    if tx.send(message).await.is_err() {
        debug!("stdio writer closed; dropping outbound message");
    }
}

async fn write_loop<W>(
    writer: W,
    mut rx: mpsc::Receiver<Value>,
    stats: Arc<ServerStats>,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, LineCodec::new());
    while let Some(message) = rx.recv().await {
        let line = serde_json::to_string(&message)?;
        sink.send(line).await?;
        stats.sent();
    }
    Ok(())
}

/// Write push-origin events as they are appended to the local log.
async fn forward_push(session: Arc<Session>, tx: mpsc::Sender<Value>, ct: CancellationToken) {
    let mut watermark = session.events().subscribe();
    let mut delivered = session.events().latest_seq();
    loop {
        tokio::select! {
            biased;
            () = ct.cancelled() => break,
            changed = watermark.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let latest = *watermark.borrow_and_update();
        if latest <= delivered {
            continue;
        }
        match session.events().since(delivered) {
            Ok(events) => {
                for event in &events {
                    if session.pushes(event) && tx.send(event.payload.clone()).await.is_err() {
                        return;
                    }
                }
                delivered = events.last().map_or(latest, |event| event.seq);
                session.events().acknowledge(delivered);
            }
            Err(err) => {
                warn!(%err, "local push stream fell behind; skipping ahead");
                delivered = latest;
            }
        }
    }
}
