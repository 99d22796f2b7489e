//! Event ingress: client lifecycle and message events become shared facts.
//!
//! Dispatch goes through [`DISPATCH`], a table keyed by [`EventKind`]. Each
//! entry is a pure planner from `(event, registry view, limits)` to a
//! [`Plan`]; [`Ingress::handle`] executes plans against the registry and the
//! store. The local mutation is applied before any store call, so it happens
//! even when the transport is down.

use std::sync::Arc;

use metrics::counter;
use relay_core::constants::{CONNECTION_COUNT_KEY, CONNECTION_COUNT_UPDATED_TOPIC, NEW_MESSAGE_TOPIC};
use relay_core::{RelayError, Result};
use relay_store::{BroadcastChannel, CounterStore, RelayStore};
use tracing::{debug, error, warn};

use crate::metrics::{INGRESS_PUBLISHES_TOTAL, INGRESS_REJECTED_TOTAL, INVARIANT_VIOLATIONS_TOTAL, TRANSPORT_FAILURES_TOTAL};
use crate::registry::{ConnectionHandle, ConnectionRegistry, RegistryView};

/// An inbound client event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// The client attached.
    Connect,
    /// The client submitted chat text (absent when the frame had none).
    Message(Option<String>),
    /// The client went away.
    Disconnect,
}

impl ClientEvent {
    /// Dispatch key.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect => EventKind::Connect,
            Self::Message(_) => EventKind::Message,
            Self::Disconnect => EventKind::Disconnect,
        }
    }
}

/// Dispatch key for [`DISPATCH`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`ClientEvent::Connect`]
    Connect,
    /// [`ClientEvent::Message`]
    Message,
    /// [`ClientEvent::Disconnect`]
    Disconnect,
}

/// Registry change to apply before touching the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Remove the connection and decrement the local count.
    Detach,
}

/// Shared-state change to perform after the local mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SharedAction {
    /// `INCR` the counter and publish the new total.
    Increment,
    /// `DECR` the counter and publish the new total.
    Decrement,
    /// Publish raw text on the message topic.
    PublishMessage(String),
}

/// Why an event produced no shared action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Text was absent or empty. Silent.
    EmptyText,
    /// Text exceeded the configured limit.
    TooLong {
        /// Characters received.
        chars: usize,
        /// Configured maximum.
        max: usize,
    },
    /// The handle was already detached.
    NotAttached,
}

impl Rejection {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::EmptyText => "empty_text",
            Self::TooLong { .. } => "too_long",
            Self::NotAttached => "not_attached",
        }
    }
}

/// Outcome of planning one event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Local registry change.
    pub mutation: Option<Mutation>,
    /// Store/channel change.
    pub action: Option<SharedAction>,
    /// Set when the event was deliberately ignored.
    pub rejection: Option<Rejection>,
}

impl Plan {
    fn rejected(rejection: Rejection) -> Self {
        Self {
            rejection: Some(rejection),
            ..Self::default()
        }
    }
}

/// Limits the planners enforce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngressLimits {
    /// Chat text longer than this many characters is dropped.
    pub max_message_chars: usize,
}

impl Default for IngressLimits {
    fn default() -> Self {
        Self {
            max_message_chars: relay_core::constants::DEFAULT_MAX_MESSAGE_CHARS,
        }
    }
}

/// A pure planner.
pub type Planner = fn(&ClientEvent, &RegistryView, &IngressLimits) -> Plan;

/// The dispatch table.
pub const DISPATCH: [(EventKind, Planner); 3] = [
    (EventKind::Connect, plan_connect),
    (EventKind::Message, plan_message),
    (EventKind::Disconnect, plan_disconnect),
];

/// Look up the planner for `kind`.
pub fn planner_for(kind: EventKind) -> Option<Planner> {
    DISPATCH
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, planner)| *planner)
}

/// Plan an event through the dispatch table.
pub fn plan(event: &ClientEvent, view: &RegistryView, limits: &IngressLimits) -> Plan {
    match planner_for(event.kind()) {
        Some(planner) => planner(event, view, limits),
        None => Plan::default(),
    }
}

fn plan_connect(_event: &ClientEvent, view: &RegistryView, _limits: &IngressLimits) -> Plan {
    if !view.attached {
        return Plan::rejected(Rejection::NotAttached);
    }
    Plan {
        action: Some(SharedAction::Increment),
        ..Plan::default()
    }
}

fn plan_message(event: &ClientEvent, _view: &RegistryView, limits: &IngressLimits) -> Plan {
    let ClientEvent::Message(text) = event else {
        return Plan::default();
    };
    let Some(text) = text.as_deref().filter(|t| !t.is_empty()) else {
        return Plan::rejected(Rejection::EmptyText);
    };
    let chars = text.chars().count();
    if chars > limits.max_message_chars {
        return Plan::rejected(Rejection::TooLong {
            chars,
            max: limits.max_message_chars,
        });
    }
    Plan {
        action: Some(SharedAction::PublishMessage(text.to_string())),
        ..Plan::default()
    }
}

fn plan_disconnect(_event: &ClientEvent, view: &RegistryView, _limits: &IngressLimits) -> Plan {
    if !view.attached {
        return Plan::rejected(Rejection::NotAttached);
    }
    Plan {
        mutation: Some(Mutation::Detach),
        action: Some(SharedAction::Decrement),
        rejection: None,
    }
}

/// Executes ingress plans against the registry and the shared store.
pub struct Ingress {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RelayStore>,
    limits: IngressLimits,
}

impl Ingress {
    /// Create an executor.
    pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn RelayStore>, limits: IngressLimits) -> Self {
        Self {
            registry,
            store,
            limits,
        }
    }

    /// The registry this ingress mutates.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// `OnConnect`: increment the shared count and publish the new total.
    pub async fn on_connect(&self, handle: &ConnectionHandle) -> Result<Plan> {
        self.handle(handle, ClientEvent::Connect).await
    }

    /// `OnMessage`: publish non-empty text verbatim.
    pub async fn on_message(&self, handle: &ConnectionHandle, text: Option<String>) -> Result<Plan> {
        self.handle(handle, ClientEvent::Message(text)).await
    }

    /// `OnDisconnect`: detach, decrement the shared count, publish the new total.
    pub async fn on_disconnect(&self, handle: &ConnectionHandle) -> Result<Plan> {
        self.handle(handle, ClientEvent::Disconnect).await
    }

    /// Plan and execute one event. Returns the executed plan.
    pub async fn handle(&self, handle: &ConnectionHandle, event: ClientEvent) -> Result<Plan> {
        let view = self.registry.view(handle);
        let plan = plan(&event, &view, &self.limits);

        if let Some(rejection) = &plan.rejection {
            counter!(INGRESS_REJECTED_TOTAL, "reason" => rejection.reason()).increment(1);
            match rejection {
                Rejection::EmptyText => debug!(conn_id = %handle.id(), "empty message ignored"),
                Rejection::TooLong { chars, max } => {
                    warn!(conn_id = %handle.id(), chars, max, "message too long, dropped");
                }
                Rejection::NotAttached => {
                    counter!(INVARIANT_VIOLATIONS_TOTAL).increment(1);
                    let err = RelayError::InvariantViolation(format!(
                        "{:?} for detached connection {}",
                        event.kind(),
                        handle.id()
                    ));
                    error!(conn_id = %handle.id(), error = %err, "ingress invariant violated");
                    return Err(err);
                }
            }
        }

        if let Some(Mutation::Detach) = plan.mutation {
            let _ = self.registry.detach(handle)?;
        }

        if let Some(action) = &plan.action {
            self.execute(action).await.inspect_err(|e| {
                counter!(TRANSPORT_FAILURES_TOTAL, "operation" => action_name(action)).increment(1);
                warn!(conn_id = %handle.id(), error = %e, kind = e.error_kind(), "ingress action failed");
            })?;
        }
        Ok(plan)
    }

    async fn execute(&self, action: &SharedAction) -> Result<()> {
        match action {
            SharedAction::Increment => {
                let total = self.store.incr(CONNECTION_COUNT_KEY).await?;
                self.publish(CONNECTION_COUNT_UPDATED_TOPIC, &total.to_string()).await
            }
            SharedAction::Decrement => {
                let total = self.store.decr(CONNECTION_COUNT_KEY).await?;
                if total < 0 {
                    counter!(INVARIANT_VIOLATIONS_TOTAL).increment(1);
                    error!(total, "shared connection count went negative");
                }
                self.publish(CONNECTION_COUNT_UPDATED_TOPIC, &total.to_string()).await
            }
            SharedAction::PublishMessage(text) => self.publish(NEW_MESSAGE_TOPIC, text).await,
        }
    }

    async fn publish(&self, topic: &'static str, payload: &str) -> Result<()> {
        self.store.publish(topic, payload).await?;
        counter!(INGRESS_PUBLISHES_TOTAL, "topic" => topic).increment(1);
        debug!(topic, "fact published");
        Ok(())
    }
}

fn action_name(action: &SharedAction) -> &'static str {
    match action {
        SharedAction::Increment => "incr",
        SharedAction::Decrement => "decr",
        SharedAction::PublishMessage(_) => "publish",
    }
}
