//! Env directory watcher for hot reload of the JSON side files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::loader::{load_custom_headers, load_key_mappings};
use crate::config::runtime::SharedConfig;
use crate::routing::Router;

/// Which side file an event touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideFile {
    Mappings,
    Headers,
}

/// Watches the env directory and reloads mappings and headers on change.
pub struct ConfigWatcher {
    env_dir: PathBuf,
    mappings_file: PathBuf,
    headers_file: PathBuf,
    router: Arc<Router>,
    config: Arc<SharedConfig>,
}

impl ConfigWatcher {
    pub fn new(config: Arc<SharedConfig>, router: Arc<Router>) -> Self {
        let paths = &config.base().paths;
        Self {
            env_dir: paths.env_dir().to_path_buf(),
            mappings_file: paths.mappings_file(),
            headers_file: paths.headers_file(),
            router,
            config,
        }
    }

    /// Start watching. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        std::fs::create_dir_all(&self.env_dir).map_err(notify::Error::io)?;
        let env_dir = self.env_dir.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        self.handle(&event.paths);
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&env_dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?env_dir, "Config watcher started");
        Ok(watcher)
    }

    fn classify(&self, path: &Path) -> Option<SideFile> {
        let name = path.file_name()?;
        if Some(name) == self.mappings_file.file_name() {
            Some(SideFile::Mappings)
        } else if Some(name) == self.headers_file.file_name() {
            Some(SideFile::Headers)
        } else {
            None
        }
    }

    fn handle(&self, paths: &[PathBuf]) {
        let mut touched: Vec<SideFile> = paths.iter().filter_map(|p| self.classify(p)).collect();
        touched.dedup();
        for file in touched {
            match file {
                SideFile::Mappings => self.reload_mappings(),
                SideFile::Headers => self.reload_headers(),
            }
        }
    }

    fn reload_mappings(&self) {
        tracing::info!("Key mappings change detected, reloading...");
        match load_key_mappings(&self.mappings_file) {
            Ok(mappings) => self.router.reload(mappings),
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload key mappings. Keeping current table.")
            }
        }
    }

    fn reload_headers(&self) {
        tracing::info!("Custom headers change detected, reloading...");
        match load_custom_headers(&self.headers_file) {
            Ok(headers) => self.config.replace_headers(headers),
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload custom headers. Keeping current headers.")
            }
        }
    }
}
