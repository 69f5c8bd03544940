//! Deferred self-restart after a configuration change.
//!
//! The restart waits a short delay so the admin response that scheduled it
//! still reaches the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::{RestartConfig, RestartStrategy};
use crate::lifecycle::Shutdown;

/// How a restart will actually be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMethod {
    /// Replace the process image with a fresh copy of the binary.
    Exec,
    /// Shut down gracefully and let the supervisor start us again.
    Signal,
}

impl RestartMethod {
    pub fn resolve(config: &RestartConfig) -> Self {
        match config.strategy {
            RestartStrategy::Exec => Self::Exec,
            RestartStrategy::Signal => Self::Signal,
            RestartStrategy::Auto if config.supervised => Self::Signal,
            RestartStrategy::Auto => Self::Exec,
        }
    }
}

/// Schedules at most one restart per process.
pub struct RestartScheduler {
    method: RestartMethod,
    delay: Duration,
    shutdown: Arc<Shutdown>,
    scheduled: AtomicBool,
}

impl RestartScheduler {
    pub fn new(config: &RestartConfig, shutdown: Arc<Shutdown>) -> Self {
        Self {
            method: RestartMethod::resolve(config),
            delay: Duration::from_millis(config.delay_ms),
            shutdown,
            scheduled: AtomicBool::new(false),
        }
    }

    pub fn method(&self) -> RestartMethod {
        self.method
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Schedule a restart. Returns false when one is already pending.
    pub fn schedule(self: &Arc<Self>) -> bool {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            tracing::debug!("Restart already scheduled");
            return false;
        }
        tracing::warn!(method = ?self.method, delay_ms = self.delay.as_millis() as u64, "Restart scheduled");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;
            this.perform();
        });
        true
    }

    fn perform(&self) {
        match self.method {
            RestartMethod::Signal => self.shutdown.trigger("restart"),
            RestartMethod::Exec => {
                let err = exec_self();
                tracing::error!(error = %err, "Re-exec failed, falling back to graceful shutdown");
                self.shutdown.trigger("restart");
            }
        }
    }
}

impl std::fmt::Debug for RestartScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartScheduler")
            .field("method", &self.method)
            .field("delay", &self.delay)
            .field("scheduled", &self.is_scheduled())
            .finish()
    }
}

/// Replace the current process with a fresh copy. Only returns on failure.
#[cfg(unix)]
fn exec_self() -> std::io::Error {
    use std::os::unix::process::CommandExt;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => return e,
    };
    tracing::info!(exe = ?exe, "Re-executing");
    std::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .exec()
}

#[cfg(not(unix))]
fn exec_self() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Unsupported, "exec restart requires unix")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_strategy_resolution() {
        let mut config = RestartConfig::default();
        assert_eq!(RestartMethod::resolve(&config), RestartMethod::Exec);

        config.supervised = true;
        assert_eq!(RestartMethod::resolve(&config), RestartMethod::Signal);

        config.strategy = RestartStrategy::Exec;
        assert_eq!(RestartMethod::resolve(&config), RestartMethod::Exec);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_restart_triggers_shutdown_after_delay() {
        let shutdown = Arc::new(Shutdown::new());
        let config = RestartConfig {
            strategy: RestartStrategy::Signal,
            delay_ms: 1000,
            supervised: false,
        };
        let scheduler = Arc::new(RestartScheduler::new(&config, Arc::clone(&shutdown)));

        assert!(scheduler.schedule());
        assert!(!scheduler.schedule());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!shutdown.is_triggered());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(shutdown.is_triggered());
    }
}
