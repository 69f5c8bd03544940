//! Live configuration shared by the request path and the admin API.
//!
//! Readers take lock-free snapshots through `arc-swap`. Writers persist
//! first and swap second, so the in-memory view never runs ahead of disk.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::env_file::{write_atomic, ConfigStore, ConfigStoreError};
use crate::config::loader::save_custom_headers;
use crate::config::metadata;
use crate::config::schema::{ProxyConfig, RuntimeSettings};
use crate::config::validation::ValidatedUpdate;

/// Error type for applying an administrative update.
#[derive(Debug, Error)]
pub enum ConfigUpdateError {
    #[error("failed to save env file: {0}")]
    Store(#[source] ConfigStoreError),

    #[error("failed to save custom headers: {0}")]
    Headers(#[source] ConfigStoreError),

    #[error("background write task failed: {0}")]
    Join(String),
}

/// Headers file as it was before an update, put back if the env write fails.
struct HeadersRollback {
    path: PathBuf,
    previous: Option<Vec<u8>>,
}

impl HeadersRollback {
    fn capture(path: PathBuf) -> Result<Self, ConfigStoreError> {
        let previous = match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(ConfigStoreError::io(&path, e)),
        };
        Ok(Self { path, previous })
    }

    async fn restore(self) {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || match &self.previous {
            Some(bytes) => write_atomic(&self.path, bytes),
            None => fs::remove_file(&self.path).map_err(|e| ConfigStoreError::io(&self.path, e)),
        })
        .await;
        match result {
            Ok(Ok(())) => tracing::info!(path = %path.display(), "Restored custom headers after failed update"),
            Ok(Err(e)) => tracing::error!(path = %path.display(), error = %e, "Failed to restore custom headers"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Custom headers restore task failed"),
        }
    }
}

/// Runtime settings tagged with a monotonically increasing version.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    pub version: u64,
    pub settings: RuntimeSettings,
}

/// Result of a successful update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub updated_fields: Vec<&'static str>,
    pub restart_required: bool,
    pub version: u64,
    pub settings: RuntimeSettings,
}

/// Shared, swappable configuration.
pub struct SharedConfig {
    base: ProxyConfig,
    settings: ArcSwap<SettingsSnapshot>,
    headers: ArcSwap<BTreeMap<String, String>>,
    store: ConfigStore,
    update_lock: Mutex<()>,
    restart_pending: AtomicBool,
}

impl SharedConfig {
    pub fn new(base: ProxyConfig, headers: BTreeMap<String, String>) -> Self {
        let store = ConfigStore::new(base.paths.env_file(), base.paths.backup_dir())
            .with_keep_backups(base.backup_keep_count);
        Self::with_store(base, headers, store)
    }

    pub fn with_store(base: ProxyConfig, headers: BTreeMap<String, String>, store: ConfigStore) -> Self {
        let snapshot = SettingsSnapshot {
            version: 1,
            settings: base.settings.clone(),
        };
        Self {
            base,
            settings: ArcSwap::from_pointee(snapshot),
            headers: ArcSwap::from_pointee(headers),
            store,
            update_lock: Mutex::new(()),
            restart_pending: AtomicBool::new(false),
        }
    }

    /// Static configuration captured at startup.
    pub fn base(&self) -> &ProxyConfig {
        &self.base
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<SettingsSnapshot> {
        self.settings.load_full()
    }

    pub fn settings(&self) -> RuntimeSettings {
        self.settings.load().settings.clone()
    }

    pub fn version(&self) -> u64 {
        self.settings.load().version
    }

    pub fn custom_headers(&self) -> Arc<BTreeMap<String, String>> {
        self.headers.load_full()
    }

    /// Replace operator headers wholesale, e.g. after the headers file changed.
    pub fn replace_headers(&self, headers: BTreeMap<String, String>) {
        tracing::info!(count = headers.len(), "Custom headers replaced");
        self.headers.store(Arc::new(headers));
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::Acquire)
    }

    /// Persist an update, then swap it into memory.
    ///
    /// Nothing in memory changes unless every durable write succeeded.
    pub async fn apply_update(&self, update: ValidatedUpdate) -> Result<UpdateOutcome, ConfigUpdateError> {
        let _guard = self.update_lock.lock().await;
        let current = self.snapshot();

        if update.is_empty() {
            return Ok(UpdateOutcome {
                updated_fields: Vec::new(),
                restart_required: false,
                version: current.version,
                settings: current.settings.clone(),
            });
        }

        let mut rollback = None;
        if let Some(headers) = update.custom_headers.clone() {
            let path = self.base.paths.headers_file();
            let saved = tokio::task::spawn_blocking(move || {
                let previous = HeadersRollback::capture(path)?;
                save_custom_headers(&previous.path, &headers)?;
                Ok::<_, ConfigStoreError>(previous)
            })
            .await
            .map_err(|e| ConfigUpdateError::Join(e.to_string()))?
            .map_err(ConfigUpdateError::Headers)?;
            rollback = Some(saved);
        }

        let env = update.env_updates();
        if !env.is_empty() {
            if let Err(e) = self.store.update_env(env, true).await {
                if let Some(rollback) = rollback {
                    rollback.restore().await;
                }
                return Err(ConfigUpdateError::Store(e));
            }
        }

        let next = update.apply_to(&current.settings);
        let fields = update.fields();
        let old_headers = self.custom_headers();
        let changed: Vec<&str> = fields
            .iter()
            .copied()
            .filter(|f| {
                let before = metadata::current_value(f, &current.settings, &old_headers);
                let after = match &update.custom_headers {
                    Some(h) if *f == "custom_headers" => serde_json::json!(h),
                    _ => metadata::current_value(f, &next, &old_headers),
                };
                before != after
            })
            .collect();
        let restart_required = metadata::requires_restart(&changed);

        let version = current.version + 1;
        self.settings.store(Arc::new(SettingsSnapshot {
            version,
            settings: next.clone(),
        }));
        if let Some(headers) = update.custom_headers {
            self.headers.store(Arc::new(headers));
        }
        if restart_required {
            self.restart_pending.store(true, Ordering::Release);
        }

        tracing::info!(version, fields = ?fields, restart_required, "Configuration updated");

        Ok(UpdateOutcome {
            updated_fields: fields,
            restart_required,
            version,
            settings: next,
        })
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("version", &self.version())
            .field("env_file", &self.store.env_file())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_custom_headers;
    use crate::config::validation::{validate_update, ConfigUpdate};
    use serde_json::json;

    fn shared_in(dir: &std::path::Path) -> SharedConfig {
        let base = ProxyConfig::from_env(dir, &BTreeMap::new());
        SharedConfig::new(base, BTreeMap::new())
    }

    fn validated(value: serde_json::Value) -> ValidatedUpdate {
        let update: ConfigUpdate = serde_json::from_value(value).unwrap();
        validate_update(update).unwrap()
    }

    #[tokio::test]
    async fn test_live_update_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_in(dir.path());
        assert_eq!(shared.version(), 1);

        let outcome = shared
            .apply_update(validated(json!({"target_base_url": "https://b.example"})))
            .await
            .unwrap();

        assert_eq!(outcome.version, 2);
        assert!(!outcome.restart_required);
        assert_eq!(shared.settings().target_base_url, "https://b.example");

        let on_disk = shared.store().load_env().unwrap();
        assert_eq!(on_disk["API_BASE_URL"], "https://b.example");
        assert!(!shared.restart_pending());
    }

    #[tokio::test]
    async fn test_port_change_requires_restart() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_in(dir.path());

        let same = shared.apply_update(validated(json!({"port": 8088}))).await.unwrap();
        assert!(!same.restart_required);

        let changed = shared.apply_update(validated(json!({"port": 9001}))).await.unwrap();
        assert!(changed.restart_required);
        assert!(shared.restart_pending());
    }

    #[tokio::test]
    async fn test_headers_persisted_and_swapped() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_in(dir.path());

        shared
            .apply_update(validated(json!({"custom_headers": {"X-Team": "core"}})))
            .await
            .unwrap();

        assert_eq!(shared.custom_headers()["X-Team"], "core");
        let on_disk = load_custom_headers(&shared.base().paths.headers_file()).unwrap();
        assert_eq!(on_disk["X-Team"], "core");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_in(dir.path());
        std::fs::create_dir_all(shared.base().paths.env_file()).unwrap();

        let err = shared
            .apply_update(validated(json!({"preserve_host": true})))
            .await
            .unwrap_err();

        assert!(matches!(err, ConfigUpdateError::Store(_)));
        assert!(!shared.settings().preserve_host);
        assert_eq!(shared.version(), 1);
    }

    #[tokio::test]
    async fn test_failed_env_write_restores_headers_file() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_in(dir.path());
        let headers_file = shared.base().paths.headers_file();
        std::fs::write(&headers_file, "{\"X-Old\": \"1\"}\n").unwrap();
        std::fs::create_dir_all(shared.base().paths.env_file()).unwrap();

        let err = shared
            .apply_update(validated(json!({"preserve_host": true, "custom_headers": {"X-New": "1"}})))
            .await
            .unwrap_err();

        assert!(matches!(err, ConfigUpdateError::Store(_)));
        assert_eq!(std::fs::read_to_string(&headers_file).unwrap(), "{\"X-Old\": \"1\"}\n");
        assert!(shared.custom_headers().is_empty());
    }

    #[tokio::test]
    async fn test_failed_env_write_removes_new_headers_file() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared_in(dir.path());
        std::fs::create_dir_all(shared.base().paths.env_file()).unwrap();

        shared
            .apply_update(validated(json!({"debug_mode": true, "custom_headers": {"X-New": "1"}})))
            .await
            .unwrap_err();

        assert!(!shared.base().paths.headers_file().exists());
    }
}
