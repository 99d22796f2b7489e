//! # relay-server
//!
//! One relay process: clients attach over `WebSocket`, and every fact they
//! produce goes through the shared store and broadcast channel before any
//! client sees it.
//!
//! - Connection registry: local sessions and this process's contribution to the shared count
//! - Ingress: pure per-event planners plus an executor that talks to the store
//! - Egress: subscription loops fanning channel payloads out to local sessions
//! - Reconciler: removes the local contribution on shutdown
//! - Axum shell: `/ws`, `/healthcheck`, `/metrics`, CORS, heartbeat, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod egress;
pub mod health;
pub mod heartbeat;
pub mod ingress;
pub mod metrics;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::ServerConfig;
pub use reconciler::{ReconcileOutcome, Reconciler, ensure_counter_initialized};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use server::RelayServer;
