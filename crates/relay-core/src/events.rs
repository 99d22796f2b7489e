//! Client-facing wire events.
//!
//! Inbound frames are JSON objects tagged by `type`; outbound events use the
//! same tagging with kebab-case names and camelCase fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, ProcessId};

/// A frame sent by a client over its session.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Submit a chat message. `message` is accepted as an alias for `text`.
    Message {
        /// Raw text; absent and empty are both a no-op.
        #[serde(default, alias = "message")]
        text: Option<String>,
    },
}

/// The latest shared connection count, as received from the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountUpdateEvent {
    /// Total connections across all processes.
    pub count: u64,
}

/// One chat message as delivered to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Receiver-assigned identifier.
    pub id: MessageId,
    /// Text exactly as published.
    pub text: String,
    /// Receipt time on the re-broadcasting process.
    pub created_at: DateTime<Utc>,
    /// Process that re-broadcast the message.
    pub origin_process: ProcessId,
}

/// An event pushed to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Shared connection count changed.
    ConnectionCountUpdated(CountUpdateEvent),
    /// A chat message was published somewhere in the cluster.
    NewMessage(ChatMessage),
}
