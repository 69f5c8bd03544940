//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use llm_relay::http::AppState;
use llm_relay::{ProxyConfig, Relay, Shutdown};

/// One request as the mock upstream saw it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case(name)).count()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

/// A raw-TCP upstream that records requests and answers from a closure.
pub struct MockUpstream {
    pub addr: SocketAddr,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }

    pub fn last(&self) -> CapturedRequest {
        self.requests().pop().expect("upstream saw no request")
    }
}

/// Start an upstream that always answers `status` with `body`.
pub async fn start_mock_upstream(status: u16, body: &'static str) -> MockUpstream {
    start_programmable_upstream(move |_| (status, body.to_string())).await
}

/// Start an upstream whose answer is computed from the captured request.
pub async fn start_programmable_upstream<F>(respond: F) -> MockUpstream
where
    F: Fn(&CapturedRequest) -> (u16, String) + Send + Sync + 'static,
{
    start_upstream(Duration::ZERO, respond).await
}

/// Start an upstream that waits `delay` before answering `status` with `body`.
pub async fn start_slow_upstream(delay: Duration, status: u16, body: &'static str) -> MockUpstream {
    start_upstream(delay, move |_| (status, body.to_string())).await
}

async fn start_upstream<F>(delay: Duration, respond: F) -> MockUpstream
where
    F: Fn(&CapturedRequest) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let sink = Arc::clone(&captured);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let sink = Arc::clone(&sink);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                handle_connection(socket, sink, respond, delay).await;
            });
        }
    });

    MockUpstream { addr, captured }
}

async fn handle_connection<F>(
    mut socket: TcpStream,
    sink: Arc<Mutex<Vec<CapturedRequest>>>,
    respond: Arc<F>,
    delay: Duration,
) where
    F: Fn(&CapturedRequest) -> (u16, String),
{
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let (status, body) = respond(&request);
    sink.lock().unwrap().push(request);

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(CapturedRequest {
        method,
        target,
        headers,
        body,
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A relay serving on an ephemeral port with its env dir in a temp directory.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Arc<Shutdown>,
    pub dir: tempfile::TempDir,
}

impl TestRelay {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.trigger("test finished");
    }
}

pub async fn spawn_relay(env: &[(&str, &str)]) -> TestRelay {
    spawn_relay_with(env, |_| {}).await
}

/// Like [`spawn_relay`], letting `prepare` write side files into the env dir first.
pub async fn spawn_relay_with(env: &[(&str, &str)], prepare: impl FnOnce(&Path)) -> TestRelay {
    let dir = tempfile::tempdir().unwrap();
    prepare(dir.path());

    let env: BTreeMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let config = ProxyConfig::from_env(dir.path(), &env);

    let relay = Relay::build(config).unwrap().without_watcher();
    let state = relay.state().clone();
    let shutdown = relay.shutdown();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = relay.serve(listener).await;
    });

    TestRelay {
        addr,
        state,
        shutdown,
        dir,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
