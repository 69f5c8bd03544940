//! Recurring background jobs.
//!
//! # Jobs
//! - `StatsTicker`: appends one per-minute time series sample
//! - `StatusProducer`: fans a system status line out to log subscribers
//! - `PendingJanitor`: expires requests stuck in the pending table
//!
//! Each job runs until the shutdown broadcast fires; [`BackgroundJobs`]
//! joins them with a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::lifecycle::Shutdown;
use crate::observability::log_stream::LogBroadcaster;
use crate::observability::stats::TelemetryStore;

/// How long shutdown waits for jobs to exit.
pub const JOB_GRACE_PERIOD: Duration = Duration::from_secs(5);

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub struct StatsTicker {
    telemetry: Arc<TelemetryStore>,
    period: Duration,
}

impl StatsTicker {
    pub fn new(telemetry: Arc<TelemetryStore>) -> Self {
        let period = Duration::from_secs(telemetry.config().tick_interval_secs.max(1));
        Self { telemetry, period }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(interval = ?self.period, "Stats ticker starting");
        let mut ticker = ticker(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.telemetry.tick(),
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Stats ticker stopped");
    }
}

pub struct StatusProducer {
    telemetry: Arc<TelemetryStore>,
    logs: Arc<LogBroadcaster>,
    period: Duration,
}

impl StatusProducer {
    pub fn new(telemetry: Arc<TelemetryStore>, logs: Arc<LogBroadcaster>, period: Duration) -> Self {
        Self {
            telemetry,
            logs,
            period: period.max(Duration::from_secs(1)),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(interval = ?self.period, "Status producer starting");
        let mut ticker = ticker(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.logs.subscriber_count() > 0 {
                        self.logs.broadcast_status(&self.telemetry.totals());
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Status producer stopped");
    }
}

pub struct PendingJanitor {
    telemetry: Arc<TelemetryStore>,
    period: Duration,
    timeout: Duration,
}

impl PendingJanitor {
    pub fn new(telemetry: Arc<TelemetryStore>) -> Self {
        let config = telemetry.config();
        let period = Duration::from_secs(config.sweep_interval_secs.max(1));
        let timeout = Duration::from_secs(config.pending_timeout_secs);
        Self {
            telemetry,
            period,
            timeout,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!(interval = ?self.period, timeout = ?self.timeout, "Pending janitor starting");
        let mut ticker = ticker(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.telemetry.sweep_pending(self.timeout);
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Pending janitor stopped");
    }
}

/// Handles of the spawned recurring jobs.
pub struct BackgroundJobs {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundJobs {
    /// Spawn every recurring job, each subscribed to `shutdown`.
    pub fn spawn(
        shutdown: &Shutdown,
        telemetry: Arc<TelemetryStore>,
        logs: Arc<LogBroadcaster>,
        status_interval: Duration,
    ) -> Self {
        let handles = vec![
            tokio::spawn(StatsTicker::new(Arc::clone(&telemetry)).run(shutdown.subscribe())),
            tokio::spawn(
                StatusProducer::new(Arc::clone(&telemetry), logs, status_interval).run(shutdown.subscribe()),
            ),
            tokio::spawn(PendingJanitor::new(telemetry).run(shutdown.subscribe())),
        ];
        Self { handles }
    }

    /// Wait for every job to exit, aborting stragglers after `grace`.
    pub async fn join(self, grace: Duration) {
        let mut handles = self.handles;
        let all = futures_util::future::join_all(handles.iter_mut());
        if time::timeout(grace, all).await.is_err() {
            tracing::warn!(grace = ?grace, "Background jobs did not stop in time, aborting");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}
