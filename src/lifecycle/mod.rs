//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     ProxyConfig → side files → Initialize subsystems → Spawn jobs → Serve
//!
//! Shutdown (shutdown.rs):
//!     Signal or restart → broadcast → server drains, jobs exit within grace
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Restart (restart.rs):
//!     Restart-only setting changed → delay → exec self, or shutdown for a supervisor
//! ```
//!
//! # Design Decisions
//! - Every recurring job owns a shutdown receiver and exits on its own
//! - Shutdown has a timeout: jobs still running after the grace period are aborted

pub mod jobs;
pub mod restart;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use jobs::BackgroundJobs;
pub use restart::RestartScheduler;
pub use shutdown::Shutdown;
pub use startup::{Relay, StartupError};
