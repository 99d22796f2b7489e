//! Event egress: re-emit every fact from the broadcast channel to every
//! locally attached client, including the client that caused it.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use relay_core::constants::{CONNECTION_COUNT_UPDATED_TOPIC, NEW_MESSAGE_TOPIC};
use relay_core::{ChatMessage, CountUpdateEvent, MessageId, ProcessId, RelayError, Result, ServerEvent};
use relay_store::{BroadcastChannel, Subscription};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ClientConnection;
use crate::metrics::{EGRESS_DELIVERIES_TOTAL, INVARIANT_VIOLATIONS_TOTAL, MALFORMED_PAYLOADS_TOTAL, WS_DROPPED_FRAMES_TOTAL};
use crate::registry::ConnectionRegistry;

/// Why an egress loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressExit {
    /// Shutdown was requested.
    Cancelled,
    /// The subscription ended underneath the loop.
    SubscriptionClosed(String),
}

/// Turns raw channel payloads into client events.
pub struct Egress {
    registry: Arc<ConnectionRegistry>,
}

impl Egress {
    /// Fan out to the clients in `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one count payload. Returns the number of clients it was queued for.
    ///
    /// The payload must be an integer. A negative total is clamped to 0 and
    /// reported as an invariant violation; clients only ever see counts >= 0.
    pub fn deliver_count(&self, payload: &str) -> Result<usize> {
        let raw: i64 = payload.trim().parse().map_err(|_| {
            counter!(MALFORMED_PAYLOADS_TOTAL, "topic" => CONNECTION_COUNT_UPDATED_TOPIC).increment(1);
            RelayError::malformed(CONNECTION_COUNT_UPDATED_TOPIC, payload)
        })?;
        let count = u64::try_from(raw).unwrap_or_else(|_| {
            counter!(INVARIANT_VIOLATIONS_TOTAL).increment(1);
            error!(
                error = %RelayError::InvariantViolation(format!("negative connection count {raw}")),
                "clamping count to 0"
            );
            0
        });

        let event = ServerEvent::ConnectionCountUpdated(CountUpdateEvent { count });
        let json = match serde_json::to_string(&event) {
            Ok(json) => Arc::new(json),
            Err(e) => return Err(RelayError::InvariantViolation(e.to_string())),
        };
        let delivered = self.fan_out(CONNECTION_COUNT_UPDATED_TOPIC, |_| Some(Arc::clone(&json)));
        debug!(count, delivered, "count update delivered");
        Ok(delivered)
    }

    /// Handle one message payload. Returns the number of clients it was queued for.
    ///
    /// Timestamp and origin are fixed once per receipt; each recipient gets
    /// its own freshly minted identifier.
    pub fn deliver_message(&self, payload: &str) -> usize {
        let created_at = Utc::now();
        let origin_process: &ProcessId = self.registry.process_id();

        let delivered = self.fan_out(NEW_MESSAGE_TOPIC, |conn| {
            let event = ServerEvent::NewMessage(ChatMessage {
                id: MessageId::new(),
                text: payload.to_string(),
                created_at,
                origin_process: origin_process.clone(),
            });
            match serde_json::to_string(&event) {
                Ok(json) => Some(Arc::new(json)),
                Err(e) => {
                    warn!(conn_id = %conn.id, error = %e, "failed to serialize message");
                    None
                }
            }
        });
        debug!(delivered, "message delivered");
        delivered
    }

    fn fan_out(
        &self,
        topic: &'static str,
        mut frame_for: impl FnMut(&ClientConnection) -> Option<Arc<String>>,
    ) -> usize {
        let mut delivered = 0;
        let _ = self.registry.for_each_local(|conn| {
            let Some(frame) = frame_for(conn) else {
                return;
            };
            if conn.send(frame) {
                delivered += 1;
            } else {
                counter!(WS_DROPPED_FRAMES_TOTAL).increment(1);
                warn!(conn_id = %conn.id, topic, "client queue full or closed, frame dropped");
            }
        });
        counter!(EGRESS_DELIVERIES_TOTAL, "topic" => topic).increment(u64::try_from(delivered).unwrap_or(u64::MAX));
        delivered
    }

    /// Route one payload by topic.
    pub fn deliver(&self, topic: &str, payload: &str) -> Result<usize> {
        match topic {
            CONNECTION_COUNT_UPDATED_TOPIC => self.deliver_count(payload),
            NEW_MESSAGE_TOPIC => Ok(self.deliver_message(payload)),
            other => {
                debug!(topic = other, "payload on unknown topic ignored");
                Ok(0)
            }
        }
    }

    /// Subscription loop for one topic. Runs until cancelled or the
    /// subscription ends. Malformed payloads are logged and dropped.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription, cancel: CancellationToken) -> EgressExit {
        let topic = subscription.topic().to_string();
        info!(topic = %topic, "egress loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(topic = %topic, "egress loop cancelled");
                    return EgressExit::Cancelled;
                }
                payload = subscription.recv() => match payload {
                    Some(payload) => {
                        if let Err(e) = self.deliver(&topic, &payload) {
                            warn!(topic = %topic, error = %e, kind = e.error_kind(), "payload dropped");
                        }
                    }
                    None => {
                        warn!(topic = %topic, "subscription closed");
                        return EgressExit::SubscriptionClosed(topic);
                    }
                },
            }
        }
    }
}

/// Subscribe to both topics, then spawn one loop per topic.
///
/// Subscribing happens before this returns, so no fact published afterwards
/// is missed.
pub async fn start_egress<C: BroadcastChannel + ?Sized>(
    egress: Arc<Egress>,
    channel: &C,
    cancel: &CancellationToken,
) -> Result<Vec<JoinHandle<EgressExit>>> {
    let mut handles = Vec::with_capacity(2);
    for topic in [CONNECTION_COUNT_UPDATED_TOPIC, NEW_MESSAGE_TOPIC] {
        let subscription = channel.subscribe(topic).await?;
        handles.push(tokio::spawn(Arc::clone(&egress).run(subscription, cancel.clone())));
    }
    Ok(handles)
}
