//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, request ID)
//! - Mount the admin API under `/api/admin`
//! - Send everything else to the ForwardEngine
//! - Serve until the shutdown broadcast fires

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::admin::admin_router;
use crate::config::SharedConfig;
use crate::http::forward::ForwardEngine;
use crate::http::request::{request_id, RequestIdLayer};
use crate::lifecycle::{RestartScheduler, Shutdown};
use crate::observability::log_stream::LogBroadcaster;
use crate::observability::stats::TelemetryStore;
use crate::routing::Router as RelayRouter;

/// Name reported by the public health check.
pub const SERVICE_NAME: &str = "llm-relay";

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SharedConfig>,
    pub router: Arc<RelayRouter>,
    pub telemetry: Arc<TelemetryStore>,
    pub logs: Arc<LogBroadcaster>,
    pub forward: Arc<ForwardEngine>,
    pub restart: Arc<RestartScheduler>,
    pub shutdown: Arc<Shutdown>,
}

/// HTTP server for the relay.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/health", get(health))
            .nest("/api/admin", admin_router(state.clone()))
            .fallback(proxy_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(RequestIdLayer)
    }

    /// The assembled router, for driving the server in-process.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` resolves, then drain open connections.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "service": SERVICE_NAME }))
}

/// Every path not claimed above is relayed upstream.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let id = request_id(request.headers());
    state.forward.forward(request, &id).await
}
