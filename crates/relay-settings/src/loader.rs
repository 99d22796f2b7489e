//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{LogFormat, RelaySettings};

/// Load settings from an optional file path, then apply env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Empty values are treated as unset; out-of-range or unparsable values are
/// ignored with a warning, leaving the file/default value in place.
pub fn apply_overrides_from(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => warn!(key = "PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("CORS_ORIGIN") {
        settings.server.allowed_origin = v;
    }
    if let Some(v) = read("REDIS_ENDPOINT") {
        settings.store.endpoint = Some(v);
    }
    if let Some(v) = read("RELAY_PROCESS_ID") {
        settings.process_id = Some(v);
    }
    if let Some(v) = read("RELAY_SHUTDOWN_GRACE_MS") {
        match parse_u64_range(&v, 0, 600_000) {
            Some(ms) => settings.shutdown.grace_period_ms = ms,
            None => warn!(key = "RELAY_SHUTDOWN_GRACE_MS", value = %v, "invalid u64 env var, ignoring"),
        }
    }
    if let Some(v) = read("RELAY_LOG") {
        settings.logging.level = v;
    }
    if let Some(v) = read("RELAY_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "RELAY_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a log format name (case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.trim().to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "compact" | "text" => Some(LogFormat::Compact),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 3001, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 4000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 4000);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    // ── load_settings ───────────────────────────────────────────────

    #[test]
    fn load_without_path_returns_defaults() {
        let settings = load_settings(None).unwrap();
        assert_eq!(settings.server.port, RelaySettings::default().server.port);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings(Some(Path::new("/nonexistent/relay.json"))).unwrap();
        assert_eq!(settings.shutdown.grace_period_ms, 2000);
    }

    #[test]
    fn load_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{"server": {"allowedOrigin": "https://chat.example"}, "shutdown": {"gracePeriodMs": 5000}}"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.server.allowed_origin, "https://chat.example");
        assert_eq!(settings.shutdown.grace_period_ms, 5000);
        assert_eq!(settings.server.max_message_chars, 255);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, "not json").unwrap();

        let result = load_settings(Some(&path));
        assert!(matches!(result, Err(SettingsError::Json(_))));
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_known_vars() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(
            &mut settings,
            lookup(&[
                ("PORT", "4100"),
                ("HOST", "127.0.0.1"),
                ("CORS_ORIGIN", "*"),
                ("REDIS_ENDPOINT", "redis://cache:6379"),
                ("RELAY_PROCESS_ID", "node-a"),
                ("RELAY_SHUTDOWN_GRACE_MS", "750"),
                ("RELAY_LOG", "debug"),
                ("RELAY_LOG_FORMAT", "JSON"),
            ]),
        );
        assert_eq!(settings.server.port, 4100);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.allowed_origin, "*");
        assert_eq!(settings.store.endpoint.as_deref(), Some("redis://cache:6379"));
        assert_eq!(settings.process_id.as_deref(), Some("node-a"));
        assert_eq!(settings.shutdown.grace_period_ms, 750);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_port_is_ignored() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(&mut settings, lookup(&[("PORT", "99999")]));
        assert_eq!(settings.server.port, 3001);

        apply_overrides_from(&mut settings, lookup(&[("PORT", "zero")]));
        assert_eq!(settings.server.port, 3001);
    }

    #[test]
    fn empty_values_are_unset() {
        let mut settings = RelaySettings::default();
        apply_overrides_from(&mut settings, lookup(&[("REDIS_ENDPOINT", ""), ("HOST", " ")]));
        assert!(settings.store.endpoint.is_none());
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_u16_range("3001", 1, 65535), Some(3001));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range(" 20 ", 0, 100), Some(20));
        assert_eq!(parse_log_format("text"), Some(LogFormat::Compact));
        assert_eq!(parse_log_format("yaml"), None);
    }
}
