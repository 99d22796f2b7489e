//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::ClientFrame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::ingress::Ingress;
use crate::metrics::{
    INGRESS_REJECTED_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::registry::ConnectionHandle;

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the socket or the transport failed.
    ClientClosed,
    /// No frame arrived within the heartbeat timeout.
    TimedOut,
    /// The process is shutting down; the session is severed without a detach.
    Shutdown,
}

impl SessionEnd {
    /// Metric label.
    pub fn reason(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TimedOut => "timed_out",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether `OnDisconnect` runs for this ending.
    pub fn detaches(self) -> bool {
        !matches!(self, Self::Shutdown)
    }
}

/// Decode one inbound text frame. Unknown shapes yield `None`.
pub fn parse_frame(text: &str) -> Option<ClientFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!(error = %e, len = text.len(), "unparsable client frame");
            None
        }
    }
}

/// Attach a new session unless shutdown has begun.
///
/// Drain cancels before it reconciles, so a session admitted here is either
/// tracked by the drain or never counted.
pub fn admit(
    ingress: &Ingress,
    tx: mpsc::Sender<Arc<String>>,
    cancel: &CancellationToken,
) -> Option<ConnectionHandle> {
    if cancel.is_cancelled() {
        return None;
    }
    Some(ingress.registry().attach(tx))
}

/// Run a WebSocket session for a connected client.
///
/// 1. Attaches to the registry and runs `OnConnect`
/// 2. Forwards queued events to the socket, pinging every heartbeat interval
/// 3. Feeds `message` frames to `OnMessage`
/// 4. Runs `OnDisconnect` when the client leaves or goes silent
///
/// On shutdown the session stops without `OnDisconnect`; the reconciler
/// removes its contribution instead.
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    ingress: Arc<Ingress>,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
) -> SessionEnd {
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.send_queue.max(1));
    let Some(handle) = admit(&ingress, send_tx, &cancel) else {
        info!("shutdown in progress, session refused");
        return SessionEnd::Shutdown;
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let connection = Arc::clone(handle.connection());
    let _ = tracing::Span::current().record("conn_id", tracing::field::display(handle.id()));

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let session_stop = cancel.child_token();

    let outbound_stop = session_stop.clone();
    let ping_every = config.heartbeat_interval();
    let outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_stop.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    if let Err(e) = ingress.on_connect(&handle).await {
        debug!(error = %e, "connect not propagated to the shared store");
    }

    let heartbeat = run_heartbeat(
        Arc::clone(&connection),
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
        session_stop.clone(),
    );
    tokio::pin!(heartbeat);

    let end = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break SessionEnd::Shutdown,
            result = &mut heartbeat => match result {
                HeartbeatResult::TimedOut => {
                    warn!(silent_for = ?connection.last_seen_elapsed(), "client unresponsive, disconnecting");
                    break SessionEnd::TimedOut;
                }
                HeartbeatResult::Cancelled => break SessionEnd::Shutdown,
            },
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read failed");
                        break SessionEnd::ClientClosed;
                    }
                    None => break SessionEnd::ClientClosed,
                };
                connection.mark_alive();
                let text = match msg {
                    Message::Text(ref t) => Some(t.as_str()),
                    Message::Binary(ref data) => std::str::from_utf8(data).ok(),
                    Message::Close(_) => {
                        info!("client sent close frame");
                        break SessionEnd::ClientClosed;
                    }
                    Message::Ping(_) | Message::Pong(_) => None,
                };
                let Some(text) = text else { continue };
                handle_text(&ingress, &handle, text).await;
            }
        }
    };

    session_stop.cancel();
    let _ = outbound.await;

    if end.detaches() {
        if let Err(e) = ingress.on_disconnect(&handle).await {
            debug!(error = %e, "disconnect not propagated to the shared store");
        }
    }

    info!(reason = end.reason(), dropped = connection.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => end.reason()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    end
}

async fn handle_text(ingress: &Ingress, handle: &ConnectionHandle, text: &str) {
    match parse_frame(text) {
        Some(ClientFrame::Message { text }) => {
            // Failures are logged and counted by ingress; the session goes on.
            let _ = ingress.on_message(handle, text).await;
        }
        None => counter!(INGRESS_REJECTED_TOTAL, "reason" => "unparsable").increment(1),
    }
}
