//! Credential to upstream lookup.
//!
//! # Responsibilities
//! - Build an immutable index from `{target_url, keys[]}` records
//! - Answer `select_target` in O(1) against the current snapshot
//! - Swap in a rebuilt table on reload
//!
//! # Design Decisions
//! - Tables are never mutated in place; reload builds a new one and swaps it
//! - A key listed under several targets resolves to the last one listed
//! - Absent, empty or unmapped credentials fall back to the default target

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use crate::config::loader::KeyMappings;

/// Immutable credential index plus the default target.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    index: HashMap<String, Arc<str>>,
    default_target: Arc<str>,
}

impl RouteTable {
    pub fn build(mappings: &KeyMappings, default_target: &str) -> Self {
        let mut index = HashMap::new();
        for mapping in &mappings.mappings {
            let target = mapping.target_url.trim().trim_end_matches('/');
            if target.is_empty() {
                tracing::warn!(keys = mapping.keys.len(), "Skipping mapping without target_url");
                continue;
            }
            let target: Arc<str> = Arc::from(target);
            for key in mapping.keys.iter().filter(|k| !k.is_empty()) {
                if let Some(previous) = index.insert(key.clone(), Arc::clone(&target)) {
                    if previous != target {
                        tracing::warn!(%previous, %target, "Key mapped to several targets, last one wins");
                    }
                }
            }
        }
        Self {
            index,
            default_target: Arc::from(default_target.trim_end_matches('/')),
        }
    }

    pub fn lookup(&self, credential: Option<&str>) -> Arc<str> {
        credential
            .filter(|c| !c.is_empty())
            .and_then(|c| self.index.get(c))
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.default_target))
    }

    pub fn default_target(&self) -> &str {
        &self.default_target
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Reloadable router. Readers never block and never see a mixed table.
pub struct Router {
    table: ArcSwap<RouteTable>,
    mappings: ArcSwap<KeyMappings>,
    writer: Mutex<()>,
}

impl Router {
    pub fn new(mappings: KeyMappings, default_target: &str) -> Self {
        let table = RouteTable::build(&mappings, default_target);
        tracing::info!(keys = table.len(), default = %table.default_target(), "Route table built");
        Self {
            table: ArcSwap::from_pointee(table),
            mappings: ArcSwap::from_pointee(mappings),
            writer: Mutex::new(()),
        }
    }

    /// Upstream base URL for `credential`.
    pub fn select_target(&self, credential: Option<&str>) -> Arc<str> {
        self.table.load().lookup(credential)
    }

    /// Current table snapshot.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Replace all mappings, keeping the current default target.
    pub fn reload(&self, mappings: KeyMappings) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let default_target = self.table.load().default_target.clone();
        let table = RouteTable::build(&mappings, &default_target);
        tracing::info!(keys = table.len(), "Route table reloaded");
        self.mappings.store(Arc::new(mappings));
        self.table.store(Arc::new(table));
    }

    /// Rebuild the table around a new default target.
    pub fn set_default(&self, default_target: &str) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mappings = self.mappings.load_full();
        let table = RouteTable::build(&mappings, default_target);
        tracing::info!(default = %table.default_target(), "Default target changed");
        self.table.store(Arc::new(table));
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.load();
        f.debug_struct("Router")
            .field("keys", &table.len())
            .field("default_target", &table.default_target())
            .finish()
    }
}
