//! Bearer authentication for the admin API.

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, Request},
    middleware::Next,
    response::Response,
};

use crate::admin::AdminError;
use crate::config::schema::RuntimeSettings;
use crate::config::validation::MAX_API_KEY_LENGTH;
use crate::http::server::AppState;

pub async fn require_admin_key(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AdminError> {
    let settings = state.config.settings();
    check_access(&settings, request.headers())?;
    Ok(next.run(request).await)
}

/// Decide whether a request may use the admin API under `settings`.
pub fn check_access(settings: &RuntimeSettings, headers: &HeaderMap) -> Result<(), AdminError> {
    if !settings.dashboard_enabled {
        return Err(AdminError::DashboardDisabled);
    }
    let expected = settings.dashboard_api_key.as_str();
    if expected.is_empty() {
        return Err(AdminError::KeyNotConfigured);
    }

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token)
        .ok_or(AdminError::InvalidKey)?;

    if presented.len() > MAX_API_KEY_LENGTH || !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        tracing::warn!("Rejected admin request with invalid API key");
        return Err(AdminError::InvalidKey);
    }
    Ok(())
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
