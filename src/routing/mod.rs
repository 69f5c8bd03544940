//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request headers
//!     → credential.rs (x-api-key, else Authorization bearer)
//!     → router.rs (credential → target base URL, default on miss)
//!
//! Reload (key mappings file changed):
//!     KeyMappings
//!     → RouteTable::build
//!     → atomic swap; in-flight lookups keep their snapshot
//! ```
//!
//! # Design Decisions
//! - Lookups are lock-free and never block forwarding
//! - Full reload only; no incremental edits of a live table
//! - Deterministic: same credential and table always give the same target

pub mod credential;
pub mod router;

pub use credential::extract_credential;
pub use router::{RouteTable, Router};
