//! Header filtering and composition for forwarded requests and responses.
//!
//! Every function here is total: bad input is dropped or passed through,
//! never turned into an error.

use std::collections::BTreeMap;

use axum::http::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::schema::CompatConfig;
use crate::routing::credential::API_KEY_HEADER;

/// Headers meaningful only for a single transport connection (RFC 7230).
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Extra hop-by-hop names listed in the `Connection` header.
fn connection_tokens(src: &HeaderMap) -> Vec<String> {
    src.get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Strip hop-by-hop, `content-length` and (unless preserved) `host`.
///
/// Repeated names collapse to their first value.
pub fn filter_request_headers(src: &HeaderMap, preserve_host: bool) -> HeaderMap {
    let extra = connection_tokens(src);
    let mut out = HeaderMap::with_capacity(src.keys_len());
    for (name, value) in src.iter() {
        let lower = name.as_str();
        if is_hop_by_hop(lower) || *name == CONTENT_LENGTH {
            continue;
        }
        if *name == HOST && !preserve_host {
            continue;
        }
        if extra.iter().any(|t| t == lower) {
            continue;
        }
        if out.contains_key(name) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Strip hop-by-hop, `content-length` and `content-encoding`.
///
/// The body reaching the caller is already decoded, so its length and
/// encoding no longer match the upstream's.
pub fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let extra = connection_tokens(src);
    let mut out = HeaderMap::with_capacity(src.keys_len());
    for (name, value) in src.iter() {
        let lower = name.as_str();
        if is_hop_by_hop(lower) || *name == CONTENT_LENGTH || *name == CONTENT_ENCODING {
            continue;
        }
        if extra.iter().any(|t| t == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Inputs for composing the outbound header set.
#[derive(Debug, Clone, Copy)]
pub struct ForwardHeaderContext<'a> {
    /// Resolved upstream base URL.
    pub target: &'a str,
    pub preserve_host: bool,
    pub custom_headers: &'a BTreeMap<String, String>,
    pub compat: &'a CompatConfig,
}

/// Build the header set sent upstream.
pub fn prepare_forward_headers(inbound: &HeaderMap, ctx: &ForwardHeaderContext<'_>) -> HeaderMap {
    let mut headers = filter_request_headers(inbound, ctx.preserve_host);

    if !ctx.preserve_host {
        if let Some(value) = target_authority(ctx.target).and_then(|a| HeaderValue::from_str(&a).ok()) {
            headers.insert(HOST, value);
        }
    }

    for (name, value) in ctx.custom_headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Skipping invalid custom header"),
        }
    }

    if is_forced_target(ctx.target, ctx.compat) {
        ensure_capability_token(&mut headers, ctx.compat);
    }

    if let Some(key) = headers.remove(API_KEY_HEADER) {
        let bearer = key
            .to_str()
            .ok()
            .and_then(|k| HeaderValue::from_str(&format!("Bearer {}", k.trim())).ok());
        if let Some(bearer) = bearer {
            headers.insert(AUTHORIZATION, bearer);
        }
    }

    headers
}

/// Whether `target` is the provider with special prompt and header rules.
pub fn is_forced_target(target: &str, compat: &CompatConfig) -> bool {
    !compat.forced_target_marker.is_empty()
        && target
            .to_ascii_lowercase()
            .contains(&compat.forced_target_marker.to_ascii_lowercase())
}

/// Make the capability token appear exactly once in the capability header.
fn ensure_capability_token(headers: &mut HeaderMap, compat: &CompatConfig) {
    let Ok(name) = HeaderName::from_bytes(compat.capability_header.as_bytes()) else {
        return;
    };
    let token = compat.capability_token.as_str();

    let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) => {
            let others: Vec<&str> = existing
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty() && *t != token)
                .collect();
            let had_token = existing.split(',').any(|t| t.trim() == token);
            if had_token && others.len() + 1 == existing.split(',').filter(|t| !t.trim().is_empty()).count() {
                return;
            }
            std::iter::once(token).chain(others).collect::<Vec<_>>().join(",")
        }
        None => format!("{token},{}", compat.capability_default_tail),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

/// `host[:port]` of a base URL.
fn target_authority(target: &str) -> Option<String> {
    let url = url::Url::parse(target).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
