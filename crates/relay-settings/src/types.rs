//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! settings file only needs the values it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for a relay process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Identity stamped on re-broadcast messages. Generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// HTTP/WebSocket listener settings.
    pub server: ServerSettings,
    /// Shared counter store / broadcast channel settings.
    pub store: StoreSettings,
    /// Graceful shutdown settings.
    pub shutdown: ShutdownSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// The store endpoint, or an error if no layer provided one.
    pub fn require_store_endpoint(&self) -> Result<&str> {
        self.store
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or(SettingsError::Missing("store.endpoint"))
    }
}

/// Listener and session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Origin allowed by CORS. `*` allows any origin.
    pub allowed_origin: String,
    /// Chat text longer than this many characters is dropped.
    pub max_message_chars: usize,
    /// Interval between server pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a client is considered gone, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Per-client outbound queue capacity.
    pub send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            allowed_origin: "http://localhost:3000".to_string(),
            max_message_chars: 255,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            send_queue: 256,
        }
    }
}

/// External store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Store endpoint, e.g. `redis://127.0.0.1:6379`. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Upper bound for a single store/channel operation, in milliseconds.
    pub operation_timeout_ms: u64,
}

impl StoreSettings {
    /// Operation timeout as a `Duration`.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            operation_timeout_ms: 2_000,
        }
    }
}

/// Graceful shutdown settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// Time granted to reconcile shared state before exiting, in milliseconds.
    pub grace_period_ms: u64,
}

impl ShutdownSettings {
    /// Grace period as a `Duration`.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 2_000,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable single line.
    #[default]
    Compact,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
