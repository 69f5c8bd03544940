//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! startup:
//!     process env (defaults)
//!     → env/.env overrides (env_file.rs, durable state wins)
//!     → schema.rs ProxyConfig
//!     → loader.rs headers + key mappings
//!     → runtime.rs SharedConfig (versioned, swappable)
//!
//! admin update:
//!     ConfigUpdate
//!     → validation.rs (collect every error)
//!     → env_file.rs / loader.rs durable writes
//!     → runtime.rs atomic swap, restart flag if needed
//!
//! side file changed on disk:
//!     watcher.rs detects change
//!     → loader.rs reloads
//!     → Router / SharedConfig swap
//! ```
//!
//! # Design Decisions
//! - Durable write first, in-memory swap second
//! - Readers take snapshots; nothing is mutated in place
//! - All fields have defaults to allow a missing env file

pub mod env_file;
pub mod loader;
pub mod metadata;
pub mod runtime;
pub mod schema;
pub mod validation;
pub mod watcher;

use std::collections::BTreeMap;
use std::path::Path;

pub use env_file::{ConfigStore, ConfigStoreError};
pub use runtime::{ConfigUpdateError, SharedConfig};
pub use schema::{ProxyConfig, RuntimeSettings};

/// Merge the process environment with the env file; the file wins.
pub fn load_startup_env(env_dir: &Path) -> Result<BTreeMap<String, String>, ConfigStoreError> {
    let mut merged: BTreeMap<String, String> = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect();
    let store = ConfigStore::new(env_dir.join(".env"), env_dir.join("backups"));
    merged.extend(store.load_env()?);
    Ok(merged)
}
