//! Server configuration.

use std::time::Duration;

use relay_settings::RelaySettings;
use serde::{Deserialize, Serialize};

use crate::ingress::IngressLimits;

/// Runtime configuration for one relay process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// CORS origin allowed to open sessions (`*` for any).
    pub allowed_origin: String,
    /// Longest accepted message, in characters.
    pub max_message_chars: usize,
    /// Interval between server pings and liveness checks.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a client is disconnected.
    pub heartbeat_timeout_ms: u64,
    /// Outbound frames buffered per session before dropping.
    pub send_queue: usize,
    /// Budget for draining sessions and reconciling on shutdown.
    pub shutdown_grace_ms: u64,
}

impl ServerConfig {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Heartbeat timeout as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Shutdown grace period as a `Duration`.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Limits applied to inbound client events.
    pub fn ingress_limits(&self) -> IngressLimits {
        IngressLimits {
            max_message_chars: self.max_message_chars,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            allowed_origin: "*".into(),
            max_message_chars: relay_core::constants::DEFAULT_MAX_MESSAGE_CHARS,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            send_queue: 256,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl From<&RelaySettings> for ServerConfig {
    fn from(settings: &RelaySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            allowed_origin: server.allowed_origin.clone(),
            max_message_chars: server.max_message_chars,
            heartbeat_interval_ms: server.heartbeat_interval_ms,
            heartbeat_timeout_ms: server.heartbeat_timeout_ms,
            send_queue: server.send_queue,
            shutdown_grace_ms: settings.shutdown.grace_period_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_with_auto_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.allowed_origin, "*");
    }

    #[test]
    fn default_durations() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_secs(90));
        assert_eq!(cfg.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn zero_interval_is_floored() {
        let cfg = ServerConfig {
            heartbeat_interval_ms: 0,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_millis(1));
    }

    #[test]
    fn ingress_limits_follow_config() {
        let cfg = ServerConfig {
            max_message_chars: 10,
            ..ServerConfig::default()
        };
        assert_eq!(cfg.ingress_limits().max_message_chars, 10);
    }

    #[test]
    fn from_settings_copies_every_field() {
        let mut settings = RelaySettings::default();
        settings.server.host = "10.0.0.1".into();
        settings.server.port = 4000;
        settings.server.allowed_origin = "https://chat.example".into();
        settings.server.send_queue = 8;
        settings.shutdown.grace_period_ms = 750;

        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.host, "10.0.0.1");
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.allowed_origin, "https://chat.example");
        assert_eq!(cfg.max_message_chars, 255);
        assert_eq!(cfg.send_queue, 8);
        assert_eq!(cfg.shutdown_grace_ms, 750);
    }

    #[test]
    fn deserialize_from_json_string() {
        let json = r#"{"host":"0.0.0.0","port":3001,"allowed_origin":"*","max_message_chars":5,"heartbeat_interval_ms":10,"heartbeat_timeout_ms":30,"send_queue":4,"shutdown_grace_ms":100}"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.max_message_chars, 5);
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_millis(30));
    }
}
