//! `/healthcheck` endpoint.

use serde::Serialize;
use std::time::Instant;

use relay_core::ProcessId;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Identity of this process.
    pub process: ProcessId,
    /// Port the listener is bound to.
    pub port: u16,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions attached to this process.
    pub connections: usize,
}

/// Build a health response from live state.
pub fn health_check(start_time: Instant, process: &ProcessId, port: u16, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        process: process.clone(),
        port,
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), &ProcessId::new(), 3001, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, &ProcessId::new(), 0, 0);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), &ProcessId::from("proc_x"), 3002, 4);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["process"], "proc_x");
        assert_eq!(parsed["port"], 3002);
        assert_eq!(parsed["connections"], 4);
        assert!(parsed["uptime_secs"].is_number());
    }
}
