//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric names.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Outbound frames dropped because a client queue was full (counter).
pub const WS_DROPPED_FRAMES_TOTAL: &str = "ws_dropped_frames_total";
/// Facts published to the channel (counter, labels: topic).
pub const INGRESS_PUBLISHES_TOTAL: &str = "ingress_publishes_total";
/// Inbound client frames dropped before publishing (counter, labels: reason).
pub const INGRESS_REJECTED_TOTAL: &str = "ingress_rejected_total";
/// Per-client deliveries from the channel (counter, labels: topic).
pub const EGRESS_DELIVERIES_TOTAL: &str = "egress_deliveries_total";
/// Store or channel failures (counter, labels: operation).
pub const TRANSPORT_FAILURES_TOTAL: &str = "transport_failures_total";
/// Unparsable published facts (counter, labels: topic).
pub const MALFORMED_PAYLOADS_TOTAL: &str = "malformed_payloads_total";
/// Invariant violations caught and clamped (counter).
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "invariant_violations_total";
