//! Error taxonomy for the relay protocol.
//!
//! None of these are fatal once the process is serving: transport failures
//! abort the current operation, malformed payloads are dropped, invariant
//! violations are clamped and logged as bugs.

use thiserror::Error;

/// Errors raised by the relay core and its store bindings.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// The shared counter store or broadcast channel could not be reached.
    #[error("transport unavailable during {operation}: {message}")]
    TransportUnavailable {
        /// Store/channel operation that failed (e.g. `INCR`, `PUBLISH`).
        operation: &'static str,
        /// Underlying cause.
        message: String,
    },

    /// A published fact (or a stored value) could not be parsed.
    #[error("malformed payload on {source_name}: {payload:?}")]
    MalformedPayload {
        /// Topic or key the payload came from.
        source_name: String,
        /// The offending payload, verbatim.
        payload: String,
    },

    /// Internal bookkeeping was about to break an invariant.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl RelayError {
    /// Build a `TransportUnavailable` from any displayable cause.
    pub fn transport(operation: &'static str, cause: impl std::fmt::Display) -> Self {
        Self::TransportUnavailable {
            operation,
            message: cause.to_string(),
        }
    }

    /// Build a `MalformedPayload` for a topic or key.
    pub fn malformed(source_name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::MalformedPayload {
            source_name: source_name.into(),
            payload: payload.into(),
        }
    }

    /// Whether the failure came from the external store/channel.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportUnavailable { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TransportUnavailable { .. } => "transport_unavailable",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::InvariantViolation(_) => "invariant_violation",
        }
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
