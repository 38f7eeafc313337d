//! The controller's single HTTP listener
//!
//! One port serves the kubelet liveness and readiness checks, the Prometheus
//! scrape and the Rollout admission webhook:
//!
//! | Route | Answer |
//! |---|---|
//! | `GET /healthz` | 200 while the process runs |
//! | `GET /readyz` | 200 only in [`ControllerPhase::Watching`], body is the phase |
//! | `GET /metrics` | Prometheus text format |
//! | `POST /validate` | AdmissionReview for Rollouts |
//!
//! The API server only calls webhooks over HTTPS, so `/validate` is usable
//! only when certificate files are configured.

use crate::config::TlsFiles;
use crate::server::metrics::SharedMetrics;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Where the controller is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPhase {
    /// Connecting to the API server and checking the Rollout CRD is served
    Starting,
    /// Rollouts and owned Deployments are being watched
    Watching,
    /// Shutdown requested; in-flight reconciles are finishing
    Draining,
}

impl ControllerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerPhase::Starting => "starting",
            ControllerPhase::Watching => "watching",
            ControllerPhase::Draining => "draining",
        }
    }
}

/// Controller phase shared between `main` and `/readyz`
///
/// Phases only move forward: Starting, then Watching, then Draining.
#[derive(Debug, Clone)]
pub struct ReadinessState {
    phase: Arc<watch::Sender<ControllerPhase>>,
}

impl ReadinessState {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ControllerPhase::Starting);
        Self {
            phase: Arc::new(sender),
        }
    }

    /// The API server answered for Rollouts; ignored once draining
    pub fn mark_watching(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == ControllerPhase::Starting {
                *phase = ControllerPhase::Watching;
                true
            } else {
                false
            }
        });
    }

    /// Stop advertising readiness while reconciles drain
    pub fn mark_draining(&self) {
        self.phase.send_replace(ControllerPhase::Draining);
    }

    pub fn phase(&self) -> ControllerPhase {
        *self.phase.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == ControllerPhase::Watching
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct ServerState {
    readiness: ReadinessState,
    metrics: SharedMetrics,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ServerState>) -> (StatusCode, &'static str) {
    let phase = state.readiness.phase();
    let code = if phase == ControllerPhase::Watching {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, phase.as_str())
}

async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

fn build_router(readiness: ReadinessState, metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .route("/validate", post(super::webhook::handle_validate))
        .with_state(ServerState { readiness, metrics })
}

/// Serve every route on `port` until the task is aborted
///
/// With `tls` the listener speaks HTTPS using the PEM certificate chain and
/// key, typically mounted from a cert-manager Secret. Without it, plain HTTP.
pub async fn run_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
    tls: Option<TlsFiles>,
) -> Result<(), std::io::Error> {
    use axum_server::tls_rustls::RustlsConfig;

    let app = build_router(readiness, metrics);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    match tls {
        Some(files) => {
            let config = RustlsConfig::from_pem_file(&files.cert, &files.key).await?;
            info!(port = %port, cert = %files.cert.display(), "Serving health, metrics and webhook (HTTPS)");
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(port = %port, "Serving health and metrics (HTTP)");
            axum::serve(listener, app)
                .await
                .map_err(std::io::Error::other)
        }
    }
}
