//! Request telemetry: counters, bounded rings, per-path aggregates and
//! per-minute samples.
//!
//! # Responsibilities
//! - Track each request from start to exactly one terminal record
//! - Keep the newest requests, errors and minute samples in FIFO rings
//! - Expire in-flight entries whose terminal event never arrives
//! - Build the admin stats and error reports
//!
//! # Design Decisions
//! - One std mutex guards all state; it is only held for in-memory work and
//!   never across an `.await`
//! - Terminal events for ids no longer pending are ignored
//! - Minute samples are re-derived from the recent ring, so history older
//!   than the ring is an undercount

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::config::schema::TelemetryConfig;
use crate::observability::metrics;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Error,
    Pending,
}

/// One completed request, as kept in the recent ring.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub path: String,
    pub method: String,
    pub status: RequestStatus,
    pub bytes: u64,
    /// Seconds.
    pub response_time: f64,
    /// Unix seconds at completion.
    pub timestamp: f64,
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A failed request with its diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub request_id: String,
    pub path: String,
    pub method: String,
    pub error: String,
    pub timestamp: f64,
    pub response_time: f64,
    pub status_code: Option<u16>,
    pub response_content: Option<String>,
}

/// Aggregates for one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PathStats {
    pub count: u64,
    pub bytes: u64,
    pub errors: u64,
    /// Running mean in seconds over timed completions.
    pub avg_response_time: f64,
    #[serde(skip)]
    timed: u64,
}

impl PathStats {
    fn observe(&mut self, response_time: f64) {
        self.timed += 1;
        let n = self.timed as f64;
        self.avg_response_time = (self.avg_response_time * (n - 1.0) + response_time) / n;
    }
}

/// One per-minute sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindowSample {
    /// Unix seconds, floored to the minute.
    pub time: i64,
    pub count: u64,
}

/// Process-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

/// How a terminal event ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success {
        status_code: u16,
        bytes: u64,
    },
    Failure {
        status_code: Option<u16>,
        bytes: u64,
        error: String,
        response_content: Option<String>,
    },
}

#[derive(Debug)]
struct PendingEntry {
    path: String,
    method: String,
    started: Instant,
}

#[derive(Debug, Default)]
struct Series {
    requests: VecDeque<TimeWindowSample>,
    errors: VecDeque<TimeWindowSample>,
    bytes: VecDeque<TimeWindowSample>,
}

#[derive(Debug, Default)]
struct Inner {
    totals: Totals,
    recent: VecDeque<RequestRecord>,
    errors: VecDeque<ErrorRecord>,
    paths: HashMap<String, PathStats>,
    series: Series,
    pending: HashMap<String, PendingEntry>,
}

/// Concurrency-safe telemetry store.
#[derive(Debug)]
pub struct TelemetryStore {
    inner: Mutex<Inner>,
    config: TelemetryConfig,
    started_at: f64,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}

impl TelemetryStore {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            started_at: now_unix(),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request as pending.
    pub fn record_start(&self, request_id: &str, path: &str, method: &str, bytes_sent: u64) {
        let in_flight = {
            let mut inner = self.lock();
            inner.totals.total_requests += 1;
            inner.totals.total_bytes_sent += bytes_sent;
            let stats = inner.paths.entry(path.to_string()).or_default();
            stats.count += 1;
            stats.bytes += bytes_sent;
            inner.pending.insert(
                request_id.to_string(),
                PendingEntry {
                    path: path.to_string(),
                    method: method.to_string(),
                    started: Instant::now(),
                },
            );
            inner.pending.len()
        };
        metrics::set_in_flight(in_flight);
    }

    /// Record the terminal event for a pending request.
    ///
    /// Returns false when the id is unknown or already finished, in which
    /// case nothing is recorded.
    pub fn record_finish(&self, request_id: &str, outcome: Outcome, response_time: Duration) -> bool {
        let (recorded, in_flight) = {
            let mut inner = self.lock();
            let recorded = match inner.pending.remove(request_id) {
                Some(entry) => {
                    self.finish_locked(&mut inner, request_id, entry, outcome, response_time.as_secs_f64());
                    true
                }
                None => false,
            };
            (recorded, inner.pending.len())
        };
        metrics::set_in_flight(in_flight);
        if !recorded {
            tracing::debug!(request_id, "Ignoring terminal event for request no longer pending");
        }
        recorded
    }

    fn finish_locked(
        &self,
        inner: &mut Inner,
        request_id: &str,
        entry: PendingEntry,
        outcome: Outcome,
        response_time: f64,
    ) {
        let timestamp = now_unix();
        let record = match outcome {
            Outcome::Success { status_code, bytes } => {
                inner.totals.successful_requests += 1;
                inner.totals.total_bytes_received += bytes;
                inner.paths.entry(entry.path.clone()).or_default().observe(response_time);
                RequestRecord {
                    request_id: request_id.to_string(),
                    path: entry.path,
                    method: entry.method,
                    status: RequestStatus::Success,
                    bytes,
                    response_time,
                    timestamp,
                    status_code: Some(status_code),
                    error: None,
                }
            }
            Outcome::Failure {
                status_code,
                bytes,
                error,
                response_content,
            } => {
                inner.totals.failed_requests += 1;
                inner.totals.total_bytes_received += bytes;
                let stats = inner.paths.entry(entry.path.clone()).or_default();
                stats.errors += 1;
                stats.observe(response_time);

                push_bounded(
                    &mut inner.errors,
                    ErrorRecord {
                        request_id: request_id.to_string(),
                        path: entry.path.clone(),
                        method: entry.method.clone(),
                        error: error.clone(),
                        timestamp,
                        response_time,
                        status_code,
                        response_content,
                    },
                    self.config.error_capacity,
                );
                RequestRecord {
                    request_id: request_id.to_string(),
                    path: entry.path,
                    method: entry.method,
                    status: RequestStatus::Error,
                    bytes,
                    response_time,
                    timestamp,
                    status_code,
                    error: Some(error),
                }
            }
        };
        push_bounded(&mut inner.recent, record, self.config.recent_capacity);
    }

    /// Fail every pending entry older than `timeout`. Returns how many expired.
    pub fn sweep_pending(&self, timeout: Duration) -> usize {
        let (expired, in_flight) = {
            let mut inner = self.lock();
            let stale: Vec<String> = inner
                .pending
                .iter()
                .filter(|(_, e)| e.started.elapsed() >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                if let Some(entry) = inner.pending.remove(id) {
                    let elapsed = entry.started.elapsed().as_secs_f64();
                    let outcome = Outcome::Failure {
                        status_code: None,
                        bytes: 0,
                        error: format!("Request timed out after {}s without completing", timeout.as_secs()),
                        response_content: None,
                    };
                    self.finish_locked(&mut inner, id, entry, outcome, elapsed);
                }
            }
            (stale.len(), inner.pending.len())
        };
        metrics::set_in_flight(in_flight);
        if expired > 0 {
            tracing::warn!(expired, "Expired stale pending requests");
        }
        expired
    }

    /// Append one sample per series for the minute containing `now`.
    pub fn tick_at(&self, now: f64) {
        let minute = (now / 60.0).floor() as i64 * 60;
        let window_start = now - 60.0;
        let mut inner = self.lock();

        let (mut requests, mut errors, mut bytes) = (0u64, 0u64, 0u64);
        for record in inner.recent.iter().filter(|r| r.timestamp > window_start) {
            requests += 1;
            if record.status == RequestStatus::Error {
                errors += 1;
            }
            bytes += record.bytes;
        }

        let cap = self.config.series_capacity;
        push_bounded(&mut inner.series.requests, TimeWindowSample { time: minute, count: requests }, cap);
        push_bounded(&mut inner.series.errors, TimeWindowSample { time: minute, count: errors }, cap);
        push_bounded(&mut inner.series.bytes, TimeWindowSample { time: minute, count: bytes }, cap);
    }

    pub fn tick(&self) {
        self.tick_at(now_unix());
    }

    pub fn totals(&self) -> Totals {
        self.lock().totals
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn recent(&self) -> Vec<RequestRecord> {
        self.lock().recent.iter().cloned().collect()
    }

    pub fn path_stats(&self, path: &str) -> Option<PathStats> {
        self.lock().paths.get(path).copied()
    }

    /// Build the stats report for a time range.
    pub fn stats_report(&self, range: TimeRange, limit: usize) -> StatsReport {
        let now = now_unix();
        let (start, end) = range.resolve(now);

        let (requests, series, paths) = {
            let inner = self.lock();
            let requests: Vec<RequestRecord> = inner
                .recent
                .iter()
                .filter(|r| r.timestamp >= start && r.timestamp <= end)
                .cloned()
                .collect();
            let in_range = |s: &&TimeWindowSample| (s.time as f64) >= start && (s.time as f64) <= end;
            let series = TimeSeries {
                requests_per_minute: inner.series.requests.iter().filter(in_range).copied().collect(),
                errors_per_minute: inner.series.errors.iter().filter(in_range).copied().collect(),
                bytes_per_minute: inner.series.bytes.iter().filter(in_range).copied().collect(),
            };
            let paths: Vec<(String, PathStats)> = inner
                .paths
                .iter()
                .filter(|(_, s)| s.count > 0)
                .map(|(p, s)| (p.clone(), *s))
                .collect();
            (requests, series, paths)
        };

        let total = requests.len() as u64;
        let successful = requests.iter().filter(|r| is_success(r)).count() as u64;
        let failed = requests.iter().filter(|r| is_failure(r)).count() as u64;
        let response_times: Vec<f64> = requests
            .iter()
            .filter(|r| r.response_time > 0.0)
            .map(|r| r.response_time * 1000.0)
            .collect();
        let p = percentiles(&response_times, &[50.0, 95.0, 99.0]);
        let span = end - start;
        let bytes: u64 = requests.iter().map(|r| r.bytes).sum();

        let mut top: Vec<(String, PathStats)> = paths;
        top.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);

        let recent_start = requests.len().saturating_sub(if limit == 0 { requests.len() } else { limit });

        StatsReport {
            summary: Summary {
                total_requests: total,
                successful_requests: successful,
                failed_requests: failed,
                success_rate: if total > 0 { successful as f64 / total as f64 } else { 1.0 },
                avg_response_time: mean(&response_times),
                requests_per_second: if span > 0.0 { total as f64 / span } else { 0.0 },
                total_bytes_sent: bytes,
                total_bytes_sent_formatted: format_bytes(bytes),
                uptime_seconds: now - self.started_at,
            },
            performance: Performance {
                response_time_ms: ResponseTimePercentiles {
                    p50: p[0],
                    p95: p[1],
                    p99: p[2],
                },
            },
            time_series: series,
            top_paths: top
                .into_iter()
                .map(|(path, s)| PathSummary {
                    path,
                    count: s.count,
                    bytes: s.bytes,
                    errors: s.errors,
                    avg_response_time: round2(s.avg_response_time * 1000.0),
                    success_rate: (s.count.saturating_sub(s.errors)) as f64 / s.count as f64,
                })
                .collect(),
            recent_requests: requests[recent_start..].to_vec(),
        }
    }

    /// Build the paginated error report for a time range.
    pub fn errors_report(&self, range: TimeRange, limit: usize, offset: usize, path_filter: Option<&str>) -> ErrorsReport {
        let (start, end) = range.resolve(now_unix());
        let needle = path_filter.filter(|f| !f.is_empty()).map(str::to_lowercase);

        let (errors, total_requests) = {
            let inner = self.lock();
            let errors: Vec<ErrorRecord> = inner
                .errors
                .iter()
                .filter(|e| e.timestamp >= start && e.timestamp <= end)
                .filter(|e| needle.as_ref().is_none_or(|n| e.path.to_lowercase().contains(n.as_str())))
                .cloned()
                .collect();
            let total_requests = inner
                .recent
                .iter()
                .filter(|r| r.timestamp >= start && r.timestamp <= end)
                .count();
            (errors, total_requests)
        };

        let total = errors.len();
        let mut by_path: HashMap<&str, u64> = HashMap::new();
        for e in &errors {
            *by_path.entry(e.path.as_str()).or_default() += 1;
        }
        let mut by_path: Vec<(String, u64)> = by_path.into_iter().map(|(p, c)| (p.to_string(), c)).collect();
        by_path.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_path.truncate(10);

        let page: Vec<FormattedError> = if limit == 0 {
            errors.iter().skip(offset).cloned().map(FormattedError::from).collect()
        } else {
            errors.iter().skip(offset).take(limit).cloned().map(FormattedError::from).collect()
        };

        ErrorsReport {
            errors: page,
            pagination: Pagination {
                total,
                limit,
                offset,
                has_more: offset.saturating_add(limit) < total,
            },
            statistics: ErrorStatistics {
                total_errors: total,
                total_requests,
                error_rate: if total_requests > 0 { total as f64 / total_requests as f64 } else { 0.0 },
                errors_by_path: by_path,
            },
        }
    }
}

/// Optional `[start, end]` bounds in unix seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TimeRange {
    /// Missing or zero bounds default to the trailing hour.
    pub fn resolve(self, now: f64) -> (f64, f64) {
        let start = self.start.filter(|s| *s > 0.0).unwrap_or(now - 3600.0);
        let end = self.end.filter(|e| *e > 0.0).unwrap_or(now);
        (start, end)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub summary: Summary,
    pub performance: Performance,
    pub time_series: TimeSeries,
    pub top_paths: Vec<PathSummary>,
    pub recent_requests: Vec<RequestRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    /// Milliseconds.
    pub avg_response_time: f64,
    pub requests_per_second: f64,
    pub total_bytes_sent: u64,
    pub total_bytes_sent_formatted: String,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Performance {
    pub response_time_ms: ResponseTimePercentiles,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseTimePercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeSeries {
    pub requests_per_minute: Vec<TimeWindowSample>,
    pub errors_per_minute: Vec<TimeWindowSample>,
    pub bytes_per_minute: Vec<TimeWindowSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathSummary {
    pub path: String,
    pub count: u64,
    pub bytes: u64,
    pub errors: u64,
    /// Milliseconds.
    pub avg_response_time: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorsReport {
    pub errors: Vec<FormattedError>,
    pub pagination: Pagination,
    pub statistics: ErrorStatistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormattedError {
    pub request_id: String,
    pub path: String,
    pub method: String,
    pub error: String,
    pub timestamp: f64,
    pub formatted_time: String,
    /// Milliseconds.
    pub response_time: f64,
    pub status_code: Option<u16>,
    pub response_content: Option<String>,
}

impl From<ErrorRecord> for FormattedError {
    fn from(e: ErrorRecord) -> Self {
        Self {
            formatted_time: format_timestamp(e.timestamp),
            response_time: round2(e.response_time * 1000.0),
            request_id: e.request_id,
            path: e.path,
            method: e.method,
            error: e.error,
            timestamp: e.timestamp,
            status_code: e.status_code,
            response_content: e.response_content,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub total_requests: usize,
    pub error_rate: f64,
    pub errors_by_path: Vec<(String, u64)>,
}

/// Nearest-rank percentiles: sort ascending, index `floor(p·n/100)`,
/// clamped to the last element. Empty input yields 0 for every `p`.
pub fn percentiles(values: &[f64], ps: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return vec![0.0; ps.len()];
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    ps.iter()
        .map(|p| {
            let idx = ((p * n as f64) / 100.0).floor() as usize;
            sorted[idx.min(n - 1)]
        })
        .collect()
}

/// Human-readable byte count, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} PB")
}

pub fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn format_timestamp(ts: f64) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::from_unix_timestamp(ts as i64)
        .ok()
        .and_then(|dt| dt.format(&format).ok())
        .unwrap_or_default()
}

fn is_success(r: &RequestRecord) -> bool {
    match r.status_code {
        Some(code) => code < 400,
        None => r.status == RequestStatus::Success,
    }
}

fn is_failure(r: &RequestRecord) -> bool {
    match r.status_code {
        Some(code) => code >= 400,
        None => r.status == RequestStatus::Error,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn success(code: u16, bytes: u64) -> Outcome {
        Outcome::Success {
            status_code: code,
            bytes,
        }
    }

    fn failure(code: u16) -> Outcome {
        Outcome::Failure {
            status_code: Some(code),
            bytes: 10,
            error: format!("HTTP {code}"),
            response_content: Some("boom".to_string()),
        }
    }

    #[test]
    fn test_percentiles_rule() {
        assert_eq!(percentiles(&[], &[50.0, 95.0, 99.0]), vec![0.0, 0.0, 0.0]);
        assert_eq!(percentiles(&[50.0, 10.0, 40.0, 20.0, 30.0], &[50.0]), vec![30.0]);
        assert_eq!(percentiles(&[10.0, 20.0], &[100.0]), vec![20.0]);
        assert_eq!(percentiles(&[7.0], &[0.0, 99.0]), vec![7.0, 7.0]);
    }

    #[test]
    fn test_exactly_one_terminal_record() {
        let store = TelemetryStore::default();
        store.record_start("r1", "/v1/messages", "POST", 100);

        assert!(store.record_finish("r1", success(200, 5), Duration::from_millis(20)));
        assert!(!store.record_finish("r1", failure(500), Duration::from_millis(20)));

        let totals = store.totals();
        assert_eq!(totals.total_requests, 1);
        assert_eq!(totals.successful_requests, 1);
        assert_eq!(totals.failed_requests, 0);
        assert_eq!(store.recent().len(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_unknown_id_ignored() {
        let store = TelemetryStore::default();
        assert!(!store.record_finish("ghost", success(200, 0), Duration::ZERO));
        assert_eq!(store.totals(), Totals::default());
    }

    #[test]
    fn test_recent_ring_is_fifo_and_bounded() {
        let store = TelemetryStore::new(TelemetryConfig {
            recent_capacity: 3,
            error_capacity: 2,
            ..TelemetryConfig::default()
        });
        for i in 0..5 {
            let id = format!("r{i}");
            store.record_start(&id, "/p", "GET", 0);
            store.record_finish(&id, failure(502), Duration::from_millis(1));
        }

        let ids: Vec<_> = store.recent().into_iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec!["r2", "r3", "r4"]);
        let report = store.errors_report(TimeRange::default(), 0, 0, None);
        assert_eq!(report.pagination.total, 2);
        assert_eq!(store.totals().failed_requests, 5);
    }

    #[test]
    fn test_path_mean_over_timed_completions() {
        let store = TelemetryStore::default();
        for id in ["a", "b"] {
            store.record_start(id, "/p", "GET", 1);
        }
        store.record_finish("a", success(200, 0), Duration::from_millis(100));
        store.record_finish("b", failure(500), Duration::from_millis(300));

        let stats = store.path_stats("/p").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.bytes, 2);
        assert_eq!(stats.errors, 1);
        assert!((stats.avg_response_time - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_sweep_expires_pending_once() {
        let store = TelemetryStore::default();
        store.record_start("slow", "/p", "POST", 0);
        store.record_start("other", "/p", "POST", 0);
        store.record_finish("other", success(200, 0), Duration::ZERO);

        assert_eq!(store.sweep_pending(Duration::ZERO), 1);
        assert_eq!(store.sweep_pending(Duration::ZERO), 0);
        assert!(!store.record_finish("slow", success(200, 0), Duration::ZERO));

        let totals = store.totals();
        assert_eq!(totals.failed_requests, 1);
        assert_eq!(totals.successful_requests, 1);
    }

    #[test]
    fn test_tick_samples_trailing_minute() {
        let store = TelemetryStore::default();
        for (i, outcome) in [success(200, 7), failure(500), success(201, 3)].into_iter().enumerate() {
            let id = i.to_string();
            store.record_start(&id, "/p", "GET", 0);
            store.record_finish(&id, outcome, Duration::from_millis(5));
        }

        let now = now_unix();
        store.tick_at(now);
        store.tick_at(now + 120.0);

        let report = store.stats_report(
            TimeRange {
                start: Some(now - 120.0),
                end: Some(now + 240.0),
            },
            100,
        );
        let requests = &report.time_series.requests_per_minute;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].count, 3);
        assert_eq!(requests[1].count, 0);
        assert_eq!(report.time_series.errors_per_minute[0].count, 1);
        assert_eq!(report.time_series.bytes_per_minute[0].count, 20);
        assert_eq!(requests[0].time % 60, 0);
    }

    #[test]
    fn test_stats_report_summary() {
        let store = TelemetryStore::default();
        store.record_start("a", "/v1/messages", "POST", 50);
        store.record_start("b", "/v1/messages", "POST", 50);
        store.record_start("c", "/v1/models", "GET", 0);
        store.record_finish("a", success(200, 1024), Duration::from_millis(10));
        store.record_finish("b", failure(429), Duration::from_millis(30));
        store.record_finish("c", success(200, 512), Duration::from_millis(20));

        let report = store.stats_report(TimeRange::default(), 2);
        assert_eq!(report.summary.total_requests, 3);
        assert_eq!(report.summary.successful_requests, 2);
        assert_eq!(report.summary.failed_requests, 1);
        assert_eq!(report.summary.total_bytes_sent, 1546);
        assert_eq!(report.top_paths[0].path, "/v1/messages");
        assert_eq!(report.top_paths[0].count, 2);
        assert_eq!(report.recent_requests.len(), 2);
        assert_eq!(report.recent_requests[1].request_id, "c");
        assert!(report.performance.response_time_ms.p50 >= 10.0);
    }

    #[test]
    fn test_errors_report_filter_and_pagination() {
        let store = TelemetryStore::default();
        for i in 0..5 {
            let id = format!("e{i}");
            let path = if i % 2 == 0 { "/v1/Messages" } else { "/v1/models" };
            store.record_start(&id, path, "POST", 0);
            store.record_finish(&id, failure(500), Duration::from_millis(1));
        }

        let report = store.errors_report(TimeRange::default(), 2, 1, Some("messages"));
        assert_eq!(report.pagination.total, 3);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].request_id, "e2");
        assert!(!report.pagination.has_more);
        assert_eq!(report.statistics.total_requests, 5);
        assert_eq!(report.errors[0].response_content.as_deref(), Some("boom"));
    }

    #[test]
    fn test_errors_report_huge_offset() {
        let store = TelemetryStore::default();
        store.record_start("e0", "/v1/messages", "POST", 0);
        store.record_finish("e0", failure(502), Duration::from_millis(1));

        let report = store.errors_report(TimeRange::default(), 50, usize::MAX, None);
        assert!(report.errors.is_empty());
        assert_eq!(report.pagination.total, 1);
        assert!(!report.pagination.has_more);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(TelemetryStore::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let id = format!("{t}-{i}");
                        store.record_start(&id, "/p", "GET", 1);
                        let outcome = if i % 5 == 0 { failure(500) } else { success(200, 1) };
                        store.record_finish(&id, outcome, Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let totals = store.totals();
        assert_eq!(totals.total_requests, 2000);
        assert_eq!(totals.failed_requests, 400);
        assert_eq!(totals.successful_requests, 1600);
        assert_eq!(store.recent().len(), 1000);
        assert_eq!(store.path_stats("/p").unwrap().count, 2000);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_timestamp(0.0), "1970-01-01 00:00:00");
    }
}
