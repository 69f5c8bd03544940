//! Upstream forwarding.
//!
//! # Flow
//! ```text
//! inbound request
//!     → credential → Router target
//!     → prepare_forward_headers + process_request_body
//!     → TelemetryStore::record_start, "Request started"
//!     → one upstream attempt (no retries, no redirects)
//!         transport error → 502, immediate error record
//!         response        → headers filtered, body streamed through MeteredBody
//!     → MeteredBody finishes or is dropped → exactly one terminal record
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::ACCEPT_ENCODING;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use uuid::Uuid;

use crate::config::SharedConfig;
use crate::http::headers::{filter_response_headers, prepare_forward_headers, ForwardHeaderContext};
use crate::http::payload::{is_chat_path, process_request_body};
use crate::observability::log_stream::{LogBroadcaster, LogLevel};
use crate::observability::metrics;
use crate::observability::stats::{Outcome, TelemetryStore};
use crate::routing::{extract_credential, Router};

/// Largest inbound body the relay will buffer.
pub const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Sends each inbound request to its upstream and streams the answer back.
pub struct ForwardEngine {
    client: reqwest::Client,
    config: Arc<SharedConfig>,
    router: Arc<Router>,
    telemetry: Arc<TelemetryStore>,
    logs: Arc<LogBroadcaster>,
}

impl ForwardEngine {
    pub fn new(
        config: Arc<SharedConfig>,
        router: Arc<Router>,
        telemetry: Arc<TelemetryStore>,
        logs: Arc<LogBroadcaster>,
    ) -> Result<Self, reqwest::Error> {
        let timeouts = &config.base().timeouts;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .read_timeout(Duration::from_secs(timeouts.read_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            router,
            telemetry,
            logs,
        })
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    /// Forward one request. Never fails: transport problems become a 502.
    ///
    /// `trace_id` is the inbound `x-request-id`, used only for tracing. Telemetry
    /// and the log stream key on an id minted here, since callers choose the header.
    pub async fn forward(&self, request: Request<Body>, trace_id: &str) -> Response {
        let minted = Uuid::new_v4().to_string();
        let request_id = minted.as_str();
        let (parts, body) = request.into_parts();
        let method = parts.method;
        let path = parts.uri.path().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());

        let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(request_id = %request_id, path = %path, error = %e, "Failed to read request body");
                return (StatusCode::BAD_REQUEST, "Failed to read request body").into_response();
            }
        };

        let credential = extract_credential(&parts.headers);
        let target = self.router.select_target(credential.as_deref());
        let settings = self.config.settings();
        let custom_headers = self.config.custom_headers();
        let compat = &self.config.base().compat;

        let mut headers = prepare_forward_headers(
            &parts.headers,
            &ForwardHeaderContext {
                target: &target,
                preserve_host: settings.preserve_host,
                custom_headers: &custom_headers,
                compat,
            },
        );
        // The caller receives a decoded body, so the upstream encoding is negotiated here.
        headers.remove(ACCEPT_ENCODING);

        let body = if is_chat_path(&path, compat) {
            process_request_body(&body, credential.as_deref(), &target, &settings, compat)
        } else {
            body
        };

        let url = format!("{}{}", target.trim_end_matches('/'), path_and_query);
        let method_str = method.as_str().to_string();

        tracing::info!(
            request_id = %request_id,
            trace_id = %trace_id,
            method = %method,
            path = %path,
            target = %target,
            "Forwarding request"
        );
        if settings.debug_mode {
            tracing::debug!(
                request_id = %request_id,
                body = %String::from_utf8_lossy(&body[..body.len().min(1024)]),
                "Request body preview"
            );
        }

        let started = Instant::now();
        self.telemetry
            .record_start(request_id, &path, &method_str, body.len() as u64);
        self.logs.log(
            LogLevel::Info,
            format!("Request started: {method_str} {path}"),
            &path,
            request_id,
        );

        let result = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await;

        let upstream = match result {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(request_id = %request_id, url = %url, error = %e, "Upstream request failed");
                self.telemetry.record_finish(
                    request_id,
                    Outcome::Failure {
                        status_code: Some(StatusCode::BAD_GATEWAY.as_u16()),
                        bytes: 0,
                        error: format!("Upstream request failed: {e}"),
                        response_content: None,
                    },
                    started.elapsed(),
                );
                self.logs.log(
                    LogLevel::Error,
                    format!("Upstream request failed: {method_str} {path} - {e}"),
                    &path,
                    request_id,
                );
                metrics::record_request(&method_str, 502, "transport_error", started);
                return (StatusCode::BAD_GATEWAY, format!("Upstream request failed: {e}")).into_response();
            }
        };

        let status = upstream.status();
        let response_headers = filter_response_headers(upstream.headers());
        tracing::debug!(request_id = %request_id, status = status.as_u16(), "Upstream responded");

        let guard = CompletionGuard {
            request_id: request_id.to_string(),
            method: method_str,
            path,
            status,
            started,
            bytes: 0,
            snapshot: status.as_u16() >= 400,
            snapshot_cap: self.telemetry.config().snapshot_cap_bytes,
            captured: Vec::new(),
            polled: false,
            drained: false,
            interrupted: None,
            telemetry: Arc::clone(&self.telemetry),
            logs: Arc::clone(&self.logs),
        };
        let metered = MeteredBody {
            inner: upstream.bytes_stream().boxed(),
            guard: Some(guard),
        };

        let mut response = Response::new(Body::from_stream(metered));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

impl std::fmt::Debug for ForwardEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardEngine").finish_non_exhaustive()
    }
}

type UpstreamStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Response body that counts bytes and fires the terminal event once.
struct MeteredBody {
    inner: UpstreamStream,
    guard: Option<CompletionGuard>,
}

impl Stream for MeteredBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(guard) = this.guard.as_mut() {
            guard.polled = true;
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(guard) = this.guard.as_mut() {
                    guard.observe(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Mid-stream upstream failure ends the body; the caller keeps what it got.
                if let Some(mut guard) = this.guard.take() {
                    guard.drained = true;
                    guard.interrupted = Some(e.to_string());
                }
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                if let Some(mut guard) = this.guard.take() {
                    guard.drained = true;
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Terminal bookkeeping for one streamed response, run on drop.
struct CompletionGuard {
    request_id: String,
    method: String,
    path: String,
    status: StatusCode,
    started: Instant,
    bytes: u64,
    snapshot: bool,
    snapshot_cap: usize,
    captured: Vec<u8>,
    polled: bool,
    drained: bool,
    interrupted: Option<String>,
    telemetry: Arc<TelemetryStore>,
    logs: Arc<LogBroadcaster>,
}

impl CompletionGuard {
    fn observe(&mut self, chunk: &Bytes) {
        self.bytes += chunk.len() as u64;
        if self.snapshot && self.captured.len() < self.snapshot_cap {
            let room = self.snapshot_cap - self.captured.len();
            self.captured.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let code = self.status.as_u16();

        // HEAD bodies are dropped unread by the server.
        let abandoned = !self.drained && (self.polled || self.method != "HEAD");
        if abandoned {
            tracing::warn!(request_id = %self.request_id, path = %self.path, "Client disconnected during response");
            self.logs.log(
                LogLevel::Warning,
                "Client disconnected during response: stream closed before completion",
                &self.path,
                &self.request_id,
            );
        }
        if let Some(e) = &self.interrupted {
            tracing::warn!(request_id = %self.request_id, error = %e, "Upstream stream interrupted");
            self.logs.log(
                LogLevel::Warning,
                format!("Upstream stream interrupted: {e}"),
                &self.path,
                &self.request_id,
            );
        }

        let success = code < 400;
        let outcome = if success {
            Outcome::Success {
                status_code: code,
                bytes: self.bytes,
            }
        } else {
            let captured = std::mem::take(&mut self.captured);
            Outcome::Failure {
                status_code: Some(code),
                bytes: self.bytes,
                error: format!("HTTP {}: {}", code, self.status.canonical_reason().unwrap_or("Unknown")),
                response_content: Some(String::from_utf8_lossy(&captured).into_owned()),
            }
        };

        if !self.telemetry.record_finish(&self.request_id, outcome, elapsed) {
            tracing::debug!(request_id = %self.request_id, "Request already expired, terminal event ignored");
            return;
        }

        let message = if success {
            format!(
                "Request completed: {} {} - {} ({} bytes, {:.1}ms)",
                self.method,
                self.path,
                code,
                self.bytes,
                elapsed.as_secs_f64() * 1000.0
            )
        } else {
            format!(
                "Request failed: {} {} - {} {}",
                self.method,
                self.path,
                code,
                self.status.canonical_reason().unwrap_or("Unknown")
            )
        };
        let level = if success { LogLevel::Info } else { LogLevel::Error };
        self.logs.log(level, message, &self.path, &self.request_id);

        tracing::info!(
            request_id = %self.request_id,
            method = %self.method,
            path = %self.path,
            status = code,
            bytes = self.bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request finished"
        );
        metrics::record_request(&self.method, code, if success { "success" } else { "error" }, self.started);
        metrics::record_upstream_bytes(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TelemetryConfig;
    use futures_util::stream;

    fn guard(status: StatusCode, telemetry: &Arc<TelemetryStore>, logs: &Arc<LogBroadcaster>) -> CompletionGuard {
        guard_for("POST", status, telemetry, logs)
    }

    fn guard_for(
        method: &str,
        status: StatusCode,
        telemetry: &Arc<TelemetryStore>,
        logs: &Arc<LogBroadcaster>,
    ) -> CompletionGuard {
        CompletionGuard {
            request_id: "r1".to_string(),
            method: method.to_string(),
            path: "/v1/messages".to_string(),
            status,
            started: Instant::now(),
            bytes: 0,
            snapshot: status.as_u16() >= 400,
            snapshot_cap: 4,
            captured: Vec::new(),
            polled: false,
            drained: false,
            interrupted: None,
            telemetry: Arc::clone(telemetry),
            logs: Arc::clone(logs),
        }
    }

    fn chunks(parts: &[&'static [u8]]) -> UpstreamStream {
        let items: Vec<Result<Bytes, reqwest::Error>> = parts.iter().map(|p| Ok(Bytes::from_static(*p))).collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_drained_body_records_success_once() {
        let telemetry = Arc::new(TelemetryStore::new(TelemetryConfig::default()));
        let logs = Arc::new(LogBroadcaster::default());
        telemetry.record_start("r1", "/v1/messages", "POST", 3);

        let mut body = MeteredBody {
            inner: chunks(&[b"ab", b"cde"]),
            guard: Some(guard(StatusCode::OK, &telemetry, &logs)),
        };
        let mut total = 0;
        while let Some(chunk) = body.next().await {
            total += chunk.unwrap().len();
        }
        drop(body);

        assert_eq!(total, 5);
        let totals = telemetry.totals();
        assert_eq!(totals.total_requests, 1);
        assert_eq!(totals.successful_requests, 1);
        assert_eq!(totals.total_bytes_received, 5);

        let messages: Vec<String> = logs.backlog().into_iter().map(|e| e.message).collect();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Request completed: POST /v1/messages - 200 (5 bytes"));
    }

    #[tokio::test]
    async fn test_error_body_snapshot_is_capped() {
        let telemetry = Arc::new(TelemetryStore::new(TelemetryConfig::default()));
        let logs = Arc::new(LogBroadcaster::default());
        telemetry.record_start("r1", "/v1/messages", "POST", 0);

        let mut body = MeteredBody {
            inner: chunks(&[b"over", b"loaded"]),
            guard: Some(guard(StatusCode::TOO_MANY_REQUESTS, &telemetry, &logs)),
        };
        while body.next().await.is_some() {}
        drop(body);

        let totals = telemetry.totals();
        assert_eq!(totals.failed_requests, 1);
        let report = telemetry.errors_report(Default::default(), 10, 0, None);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].error, "HTTP 429: Too Many Requests");
        assert_eq!(report.errors[0].response_content.as_deref(), Some("over"));
    }

    #[tokio::test]
    async fn test_dropped_body_still_finalizes() {
        let telemetry = Arc::new(TelemetryStore::new(TelemetryConfig::default()));
        let logs = Arc::new(LogBroadcaster::default());
        telemetry.record_start("r1", "/v1/messages", "POST", 0);

        let mut body = MeteredBody {
            inner: chunks(&[b"ab", b"cd"]),
            guard: Some(guard(StatusCode::OK, &telemetry, &logs)),
        };
        let _ = body.next().await;
        drop(body);

        assert_eq!(telemetry.totals().total_requests, 1);
        assert_eq!(telemetry.pending_count(), 0);
        let backlog = logs.backlog();
        assert!(backlog.iter().any(|e| e.level == LogLevel::Warning
            && e.message.starts_with("Client disconnected during response")));
    }

    #[tokio::test]
    async fn test_unread_head_body_is_not_a_disconnect() {
        let telemetry = Arc::new(TelemetryStore::new(TelemetryConfig::default()));
        let logs = Arc::new(LogBroadcaster::default());
        telemetry.record_start("r1", "/v1/models", "HEAD", 0);

        let body = MeteredBody {
            inner: chunks(&[]),
            guard: Some(guard_for("HEAD", StatusCode::OK, &telemetry, &logs)),
        };
        drop(body);

        assert_eq!(telemetry.totals().successful_requests, 1);
        assert!(logs.backlog().iter().all(|e| e.level != LogLevel::Warning));
    }
}
