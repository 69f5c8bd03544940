//! Caller credential extraction.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

/// Dedicated API-key header, checked before `Authorization`.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Read the caller's credential: `x-api-key`, else a bearer token.
///
/// The `Bearer ` prefix is matched case-insensitively. A non-bearer
/// `Authorization` value is used as-is.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        let key = key.trim();
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }

    let auth = headers.get(AUTHORIZATION)?.to_str().ok()?.trim_start();
    let token = match strip_bearer(auth) {
        Some(token) => token.trim(),
        // A scheme with no token carries no credential.
        None if auth.trim_end().eq_ignore_ascii_case("bearer") => "",
        None => auth.trim(),
    };
    (!token.is_empty()).then(|| token.to_string())
}

fn strip_bearer(value: &str) -> Option<&str> {
    let prefix = value.get(..7)?;
    prefix.eq_ignore_ascii_case("bearer ").then(|| &value[7..])
}
