//! Operator-facing live log stream.
//!
//! # Data Flow
//! ```text
//! publish(entry)
//!     → shared backlog (bounded, drop-oldest)
//!     → try_send to every matching subscriber queue (bounded)
//!         → full or closed queue: subscriber removed
//!
//! subscribe(filter)
//!     → replay the newest matching backlog entries
//!     → live entries, heartbeat after an idle window
//! ```
//!
//! # Design Decisions
//! - Publishing never waits: a slow subscriber is dropped, not awaited
//! - The mutex guards only in-memory state and is never held across an await
//! - Dropping a `Subscription` unsubscribes it

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::schema::LogStreamConfig;
use crate::observability::metrics;
use crate::observability::stats::{format_timestamp, now_unix, Totals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    /// Parse a level name; `WARN` is accepted for `WARNING`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One log stream entry.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: f64,
    pub level: LogLevel,
    pub message: String,
    pub path: String,
    pub request_id: String,
    pub formatted_time: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, path: &str, request_id: &str) -> Self {
        let timestamp = now_unix();
        Self {
            timestamp,
            level,
            message: message.into(),
            path: path.to_string(),
            request_id: request_id.to_string(),
            formatted_time: format_timestamp(timestamp),
            kind: None,
        }
    }
}

/// Subscriber-side filter. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub path: Option<String>,
}

impl LogFilter {
    pub fn new(level: Option<&str>, path: Option<&str>) -> Self {
        Self {
            level: level.and_then(LogLevel::parse),
            path: path.filter(|p| !p.is_empty()).map(str::to_lowercase),
        }
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        if self.level.is_some_and(|l| l != entry.level) {
            return false;
        }
        match &self.path {
            Some(p) => entry.path.to_lowercase().contains(p.as_str()),
            None => true,
        }
    }
}

/// What a subscriber receives next.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Entry(LogEntry),
    Heartbeat,
}

struct Subscriber {
    tx: mpsc::Sender<LogEntry>,
    filter: LogFilter,
}

#[derive(Default)]
struct Inner {
    backlog: VecDeque<LogEntry>,
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
}

/// Fan-out of log entries to live subscribers.
pub struct LogBroadcaster {
    inner: Mutex<Inner>,
    config: LogStreamConfig,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(LogStreamConfig::default())
    }
}

impl LogBroadcaster {
    pub fn new(config: LogStreamConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the backlog and fan out to subscribers.
    pub fn publish(&self, entry: LogEntry) {
        let mut inner = self.lock();
        if self.config.backlog_capacity > 0 {
            while inner.backlog.len() >= self.config.backlog_capacity {
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(entry.clone());
        }
        Self::fan_out(&mut inner, &entry);
    }

    /// Convenience wrapper around [`publish`](Self::publish).
    pub fn log(&self, level: LogLevel, message: impl Into<String>, path: &str, request_id: &str) {
        self.publish(LogEntry::new(level, message, path, request_id));
    }

    /// Send a status line to live subscribers only; it is not kept in the backlog.
    pub fn broadcast_status(&self, totals: &Totals) {
        let mut entry = LogEntry::new(
            LogLevel::Info,
            format!(
                "System status: {} total requests, {} errors",
                totals.total_requests, totals.failed_requests
            ),
            "",
            "",
        );
        entry.kind = Some("system_status");
        let mut inner = self.lock();
        Self::fan_out(&mut inner, &entry);
    }

    fn fan_out(inner: &mut Inner, entry: &LogEntry) {
        let before = inner.subscribers.len();
        inner.subscribers.retain(|id, sub| {
            if !sub.filter.matches(entry) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(entry.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(subscriber = *id, error = %e, "Dropping log subscriber");
                    false
                }
            }
        });
        if inner.subscribers.len() != before {
            metrics::set_log_subscribers(inner.subscribers.len());
        }
    }

    /// Register a subscriber and collect its backlog replay.
    pub fn subscribe(self: &Arc<Self>, filter: LogFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let mut inner = self.lock();

        let mut replay: Vec<LogEntry> = inner
            .backlog
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(self.config.replay_count)
            .cloned()
            .collect();
        replay.reverse();

        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, Subscriber { tx, filter });
        metrics::set_log_subscribers(inner.subscribers.len());
        drop(inner);

        tracing::debug!(subscriber = id, replay = replay.len(), "Log subscriber connected");
        Subscription {
            id,
            rx,
            replay: replay.into(),
            heartbeat: Duration::from_secs(self.config.heartbeat_secs),
            broadcaster: Arc::clone(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.lock();
        if inner.subscribers.remove(&id).is_some() {
            metrics::set_log_subscribers(inner.subscribers.len());
            tracing::debug!(subscriber = id, "Log subscriber disconnected");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn backlog(&self) -> Vec<LogEntry> {
        self.lock().backlog.iter().cloned().collect()
    }
}

impl fmt::Debug for LogBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("LogBroadcaster")
            .field("backlog", &inner.backlog.len())
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<LogEntry>,
    replay: VecDeque<LogEntry>,
    heartbeat: Duration,
    broadcaster: Arc<LogBroadcaster>,
}

impl Subscription {
    /// Next replayed or live entry, or a heartbeat after an idle window.
    /// Returns `None` once the subscriber has been dropped by the broadcaster.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if let Some(entry) = self.replay.pop_front() {
            return Some(StreamEvent::Entry(entry));
        }
        match tokio::time::timeout(self.heartbeat, self.rx.recv()).await {
            Ok(Some(entry)) => Some(StreamEvent::Entry(entry)),
            Ok(None) => None,
            Err(_) => Some(StreamEvent::Heartbeat),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}
