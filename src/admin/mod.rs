//! Administrative API.
//!
//! # Data Flow
//! ```text
//! /api/admin/* request
//!     → auth.rs (dashboard enabled? key configured? bearer matches?)
//!     → handlers.rs
//!         config  → validation → SharedConfig::apply_update → restart?
//!         stats   → TelemetryStore reports
//!         logs    → LogBroadcaster subscription as SSE
//! ```

pub mod auth;
pub mod handlers;

use std::time::Duration;

use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::json;
use thiserror::Error;
use tower_http::timeout::TimeoutLayer;

use crate::config::validation::ValidationError;
use crate::config::ConfigUpdateError;
use crate::http::server::AppState;

use self::auth::require_admin_key;
use self::handlers::*;

/// Deadline for producing an admin response head.
const ADMIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Failures surfaced to administrative callers as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Dashboard is disabled")]
    DashboardDisabled,

    #[error("Dashboard API key is not configured")]
    KeyNotConfigured,

    #[error("Invalid or missing API key")]
    InvalidKey,

    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid configuration")]
    Validation(Vec<ValidationError>),

    #[error("Failed to update configuration: {0}")]
    Update(#[from] ConfigUpdateError),
}

impl AdminError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::DashboardDisabled => StatusCode::FORBIDDEN,
            AdminError::KeyNotConfigured | AdminError::InvalidKey => StatusCode::UNAUTHORIZED,
            AdminError::BadRequest(_) | AdminError::Validation(_) => StatusCode::BAD_REQUEST,
            AdminError::Update(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AdminError::Validation(errors) => json!({
                "detail": self.to_string(),
                "errors": errors
                    .iter()
                    .map(|e| json!({ "field": e.field, "message": e.message }))
                    .collect::<Vec<_>>(),
            }),
            other => json!({ "detail": other.to_string() }),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Admin request failed");
        }

        let mut response = (status, Json(body)).into_response();
        if matches!(self, AdminError::InvalidKey) {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Routes mounted under `/api/admin`, all behind the bearer check.
#[allow(deprecated)]
pub fn admin_router(state: AppState) -> Router<AppState> {
    let timed = Router::new()
        .route("/health", get(admin_health))
        .route("/config", get(get_config).put(update_config).head(head_config))
        .route("/config/metadata", get(get_config_metadata))
        .route("/stats", get(get_stats))
        .route("/errors", get(get_errors))
        .route("/logs/broadcast", post(broadcast_log))
        .layer(TimeoutLayer::new(ADMIN_TIMEOUT));

    Router::new()
        .merge(timed)
        .route("/logs/stream", get(stream_logs))
        .layer(middleware::from_fn_with_state(state, require_admin_key))
}
