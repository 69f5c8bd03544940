//! Startup orchestration.
//!
//! # Responsibilities
//! - Load the JSON side files (fail-soft: a broken file logs and starts empty)
//! - Initialize all subsystems in dependency order
//! - Start background tasks (jobs, config watcher)
//! - Serve until shutdown, then join background work
//!
//! # Design Decisions
//! - Subsystems initialize in order, not concurrently
//! - Listener is bound by the caller so tests can use port 0

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::loader::{load_custom_headers, load_key_mappings, KeyMappings};
use crate::config::watcher::ConfigWatcher;
use crate::config::{ProxyConfig, SharedConfig};
use crate::http::{AppState, ForwardEngine, HttpServer};
use crate::lifecycle::jobs::JOB_GRACE_PERIOD;
use crate::lifecycle::{BackgroundJobs, RestartScheduler, Shutdown};
use crate::observability::log_stream::LogBroadcaster;
use crate::observability::stats::TelemetryStore;
use crate::routing::Router;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully wired relay, ready to serve.
pub struct Relay {
    state: AppState,
    shutdown: Arc<Shutdown>,
    status_interval: Duration,
    watch_files: bool,
}

impl Relay {
    pub fn build(config: ProxyConfig) -> Result<Self, StartupError> {
        let headers = load_custom_headers(&config.paths.headers_file()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load custom headers, starting without them");
            BTreeMap::new()
        });
        let mappings = load_key_mappings(&config.paths.mappings_file()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load key mappings, starting without them");
            KeyMappings::default()
        });

        let shutdown = Arc::new(Shutdown::new());
        let router = Arc::new(Router::new(mappings, &config.settings.target_base_url));
        let telemetry = Arc::new(TelemetryStore::new(config.telemetry.clone()));
        let logs = Arc::new(LogBroadcaster::new(config.log_stream.clone()));
        let restart = Arc::new(RestartScheduler::new(&config.restart, Arc::clone(&shutdown)));
        let status_interval = Duration::from_secs(config.log_stream.status_interval_secs);

        let config = Arc::new(SharedConfig::new(config, headers));
        let forward = Arc::new(ForwardEngine::new(
            Arc::clone(&config),
            Arc::clone(&router),
            Arc::clone(&telemetry),
            Arc::clone(&logs),
        )?);

        Ok(Self {
            state: AppState {
                config,
                router,
                telemetry,
                logs,
                forward,
                restart,
                shutdown: Arc::clone(&shutdown),
            },
            shutdown,
            status_interval,
            watch_files: true,
        })
    }

    /// Skip the filesystem watcher.
    pub fn without_watcher(mut self) -> Self {
        self.watch_files = false;
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn shutdown(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Serve on `listener` until shutdown is triggered.
    pub async fn serve(self, listener: TcpListener) -> Result<(), StartupError> {
        let _watcher = if self.watch_files {
            match ConfigWatcher::new(Arc::clone(&self.state.config), Arc::clone(&self.state.router)).run() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled");
                    None
                }
            }
        } else {
            None
        };

        let jobs = BackgroundJobs::spawn(
            &self.shutdown,
            Arc::clone(&self.state.telemetry),
            Arc::clone(&self.state.logs),
            self.status_interval,
        );

        let shutdown = Arc::clone(&self.shutdown);
        let result = HttpServer::new(self.state.clone())
            .run(listener, async move { shutdown.wait().await })
            .await;

        self.shutdown.trigger("server stopped");
        jobs.join(JOB_GRACE_PERIOD).await;
        result.map_err(StartupError::from)
    }
}
