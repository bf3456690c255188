//! Routing-table store interface
//!
//! The store keeps one ordered list per virtual host. Index 0 of every list
//! is reserved for a non-backend placeholder (hipache puts the vhost
//! identifier there), so a list of length one has no real backends left.

use crate::config::{StoreConfig, StoreKind};
use crate::error::SyncError;
use crate::redis::RedisStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Number of non-backend entries at the head of every vhost list
pub const RESERVED_ENTRIES: usize = 1;

/// Operations on the external routing table.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Publish `backends` under `vhost`, creating the list if needed
    async fn add(&self, vhost: &str, backends: &[String]) -> Result<(), SyncError>;

    /// Remove every occurrence of each backend; returns how many entries went
    async fn remove(&self, vhost: &str, backends: &[String]) -> Result<usize, SyncError>;

    /// Delete the whole list for `vhost`
    async fn remove_all(&self, vhost: &str) -> Result<(), SyncError>;

    /// Current list for `vhost`, placeholder included. Empty if absent
    async fn find(&self, vhost: &str) -> Result<Vec<String>, SyncError>;
}

pub type SharedRouteStore = Arc<dyn RouteStore>;

/// Build the store selected by configuration
pub fn from_config(config: &StoreConfig) -> anyhow::Result<SharedRouteStore> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Redis => {
            let store = RedisStore::from_config(config)?;
            Ok(Arc::new(store))
        }
    }
}

/// In-process store with the same list layout as the Redis schema
#[derive(Debug, Default)]
pub struct MemoryStore {
    frontends: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual hosts currently holding a list
    pub fn vhosts(&self) -> Vec<String> {
        let mut vhosts: Vec<String> = self.frontends.read().keys().cloned().collect();
        vhosts.sort();
        vhosts
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn add(&self, vhost: &str, backends: &[String]) -> Result<(), SyncError> {
        let mut frontends = self.frontends.write();
        let list = frontends.entry(vhost.to_string()).or_default();
        if list.is_empty() {
            list.push(vhost.to_string());
        }
        list.extend(backends.iter().cloned());
        debug!(vhost, added = backends.len(), total = list.len(), "Backends added");
        Ok(())
    }

    async fn remove(&self, vhost: &str, backends: &[String]) -> Result<usize, SyncError> {
        let mut frontends = self.frontends.write();
        let Some(list) = frontends.get_mut(vhost) else {
            return Ok(0);
        };

        let before = list.len();
        // Never strip the placeholder, even if a backend string matches it
        let backends_only = list.split_off(RESERVED_ENTRIES.min(list.len()));
        list.extend(backends_only.into_iter().filter(|entry| !backends.contains(entry)));
        Ok(before - list.len())
    }

    async fn remove_all(&self, vhost: &str) -> Result<(), SyncError> {
        self.frontends.write().remove(vhost);
        Ok(())
    }

    async fn find(&self, vhost: &str) -> Result<Vec<String>, SyncError> {
        Ok(self
            .frontends
            .read()
            .get(vhost)
            .cloned()
            .unwrap_or_default())
    }
}
