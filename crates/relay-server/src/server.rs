//! `RelayServer`: Axum HTTP + WebSocket shell around the relay core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{ProcessId, Result};
use relay_store::RelayStore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::egress::{self, Egress, EgressExit};
use crate::health::{self, HealthResponse};
use crate::ingress::Ingress;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::registry::ConnectionRegistry;
use crate::session::run_ws_session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Ingress executor; also owns the registry.
    pub ingress: Arc<Ingress>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Tracks live sessions so shutdown can wait for them.
    pub sessions: TaskTracker,
    /// When the server started.
    pub start_time: Instant,
    /// Bound port, once listening.
    pub port: Arc<AtomicU16>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// One relay process.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RelayStore>,
    ingress: Arc<Ingress>,
    egress: Arc<Egress>,
    shutdown: Arc<ShutdownCoordinator>,
    sessions: TaskTracker,
    start_time: Instant,
    port: Arc<AtomicU16>,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a server for `process_id` on top of `store`.
    pub fn new(config: ServerConfig, process_id: ProcessId, store: Arc<dyn RelayStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(process_id));
        let ingress = Arc::new(Ingress::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            config.ingress_limits(),
        ));
        let egress = Arc::new(Egress::new(Arc::clone(&registry)));
        Self {
            port: Arc::new(AtomicU16::new(config.port)),
            config: Arc::new(config),
            registry,
            store,
            ingress,
            egress,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            sessions: TaskTracker::new(),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            ingress: Arc::clone(&self.ingress),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            sessions: self.sessions.clone(),
            start_time: self.start_time,
            port: Arc::clone(&self.port),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthcheck", get(health_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(cors_layer(&self.config.allowed_origin))
            .layer(TraceLayer::new_for_http())
    }

    /// Subscribe to both topics and spawn the egress loops.
    pub async fn start_egress(&self) -> Result<Vec<JoinHandle<EgressExit>>> {
        egress::start_egress(Arc::clone(&self.egress), self.store.as_ref(), &self.shutdown.token()).await
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        self.port.store(addr.port(), Ordering::Relaxed);

        let app = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "http server failed");
            }
        });

        info!(%addr, process = %self.registry.process_id(), "relay listening");
        Ok((addr, handle))
    }

    /// Stop accepting sessions, let in-flight handlers finish, then run the
    /// reconciler.
    ///
    /// Session draining and reconciliation share one `deadline`.
    /// Returns the reconcile outcome, or `None` if it failed or timed out.
    pub async fn drain(&self, deadline: tokio::time::Instant) -> Option<ReconcileOutcome> {
        if !self.shutdown.drain(&self.sessions, deadline).await {
            warn!("reconciling with sessions still running");
        }

        let reconciler = Reconciler::new(Arc::clone(&self.registry), Arc::clone(&self.store));
        match tokio::time::timeout_at(deadline, reconciler.reconcile()).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                error!(error = %e, kind = e.error_kind(), "reconcile failed, shared count left stale");
                None
            }
            Err(_) => {
                error!("reconcile missed the shutdown deadline");
                None
            }
        }
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// CORS for the configured origin. `*` allows any; an unparsable origin
/// allows none.
fn cors_layer(allowed_origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);
    if allowed_origin == "*" {
        return base.allow_origin(Any);
    }
    match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => base.allow_origin(origin),
        Err(e) => {
            warn!(allowed_origin, error = %e, "invalid allowed origin, cross-origin requests denied");
            base
        }
    }
}

/// Browsers always send `Origin` on upgrade; other clients may omit it.
fn origin_allowed(allowed_origin: &str, headers: &HeaderMap) -> bool {
    if allowed_origin == "*" {
        return true;
    }
    match headers.get(header::ORIGIN) {
        None => true,
        Some(origin) => origin.as_bytes() == allowed_origin.as_bytes(),
    }
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if !origin_allowed(&state.config.allowed_origin, &headers) {
        warn!(origin = ?headers.get(header::ORIGIN), "session from disallowed origin refused");
        return StatusCode::FORBIDDEN.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let AppState {
        ingress,
        config,
        shutdown,
        sessions,
        ..
    } = state;
    let cancel = shutdown.token();
    ws.on_upgrade(move |socket| async move {
        // Drain closes the tracker after cancelling, so a closed tracker
        // means the upgrade finished too late to be waited on.
        if sessions.is_closed() {
            debug!("upgrade completed after drain began, dropping socket");
            return;
        }
        let _ = sessions
            .track_future(run_ws_session(socket, ingress, config, cancel))
            .await;
    })
}

/// GET /healthcheck
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.ingress.registry();
    Json(health::health_check(
        state.start_time,
        registry.process_id(),
        state.port.load(Ordering::Relaxed),
        registry.connection_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
