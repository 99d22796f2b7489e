//! # relay-core
//!
//! Shared vocabulary for the chat relay.
//!
//! - **Branded IDs**: `ConnectionId`, `MessageId`, `ProcessId`
//! - **Well-known names**: the shared counter key and the two broadcast topics
//! - **Wire events**: inbound `ClientFrame`, outbound `ServerEvent`
//! - **Errors**: `RelayError` (transport, malformed payload, invariant)

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod events;
pub mod ids;

pub use errors::{RelayError, Result};
pub use events::{ChatMessage, ClientFrame, CountUpdateEvent, ServerEvent};
pub use ids::{ConnectionId, MessageId, ProcessId};
