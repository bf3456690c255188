//! Local route cache
//!
//! Remembers what was published for each container so that routes can be
//! retracted after the container is gone and can no longer be inspected.

use crate::resolver::ResolvedRoute;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Container id to its last-published routes.
///
/// All accessors return owned copies; nothing hands out references into
/// the map.
#[derive(Debug, Default)]
pub struct RouteCache {
    entries: DashMap<String, ResolvedRoute>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the routes published for `id`, replacing any previous entry
    pub fn insert(&self, id: &str, routes: ResolvedRoute) -> Option<ResolvedRoute> {
        self.entries.insert(id.to_string(), routes)
    }

    /// Remove and return the entry for `id`
    pub fn take(&self, id: &str) -> Option<ResolvedRoute> {
        self.entries.remove(id).map(|(_, routes)| routes)
    }

    pub fn get(&self, id: &str) -> Option<ResolvedRoute> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every entry, ordered by container id
    pub fn snapshot(&self) -> BTreeMap<String, ResolvedRoute> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
