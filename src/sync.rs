//! Publishing and retracting container routes
//!
//! `balance` publishes a container's routes and remembers them in the
//! [`RouteCache`]; `unbalance` retracts them again, preferring the cached
//! copy because a stopped container may already be gone. After each
//! operation the synchronizer waits a fixed settle interval so store
//! consumers observe the change before completion is signaled. That wait
//! assumes the store propagates within the interval; nothing verifies it.
//!
//! Operations for different containers run concurrently. A `start`
//! immediately followed by `die` for the same container can interleave
//! unless per-container serialization is enabled.

use crate::cache::RouteCache;
use crate::config::SyncConfig;
use crate::docker::SharedRuntime;
use crate::error::SyncError;
use crate::resolver::{ResolvedRoute, Resolver};
use crate::store::{SharedRouteStore, RESERVED_ENTRIES};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Capacity of the completion event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Settled result of one virtual host's store operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VhostResult {
    pub vhost: String,
    /// Number of backend entries added or removed
    #[serde(serialize_with = "serialize_outcome")]
    pub outcome: Result<usize, SyncError>,
}

fn serialize_outcome<S>(outcome: &Result<usize, SyncError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(1))?;
    match outcome {
        Ok(count) => map.serialize_entry("ok", count)?,
        Err(e) => map.serialize_entry("error", e.code())?,
    }
    map.end()
}

impl VhostResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Report of a completed balance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balanced {
    pub id: String,
    pub routes: ResolvedRoute,
    pub results: Vec<VhostResult>,
}

impl Balanced {
    /// Virtual hosts whose add failed
    pub fn failures(&self) -> impl Iterator<Item = &VhostResult> {
        self.results.iter().filter(|r| !r.is_ok())
    }
}

/// Report of a completed unbalance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unbalanced {
    pub id: String,
    pub results: Vec<VhostResult>,
}

/// Completion events for observers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Balance { id: String, routes: ResolvedRoute },
    Unbalance { id: String, results: Vec<VhostResult> },
}

/// Keeps the routing store in line with container lifecycles
pub struct Synchronizer {
    runtime: SharedRuntime,
    store: SharedRouteStore,
    resolver: Resolver,
    cache: RouteCache,
    settle_interval: Duration,
    /// Per-container operation locks, when serialization is enabled
    locks: Option<DashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<SyncEvent>,
}

impl Synchronizer {
    pub fn new(runtime: SharedRuntime, store: SharedRouteStore, config: &SyncConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            runtime,
            store,
            resolver: Resolver::from_config(config),
            cache: RouteCache::new(),
            settle_interval: config.settle_interval(),
            locks: config.serialize_per_container.then(DashMap::new),
            events,
        })
    }

    /// Receive `SyncEvent`s for operations completing from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &RouteCache {
        &self.cache
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    /// Publish the routes of container `id`.
    ///
    /// Fails with `Unreachable` if the container cannot be inspected and
    /// `NoAddress` if it has no IP. Store failures do not fail the call;
    /// they are reported per virtual host in the result.
    pub async fn balance(&self, id: &str, override_ip: Option<&str>) -> Result<Balanced, SyncError> {
        let lock = self.lock_for(id);
        let result = match &lock {
            Some(lock) => {
                let _held = lock.lock().await;
                self.publish(id, override_ip).await
            }
            None => self.publish(id, override_ip).await,
        };
        self.release_lock(id, lock);
        result
    }

    /// Retract the routes of container `id`.
    ///
    /// Uses the cached routes when present, otherwise resolves them from a
    /// fresh inspection. A container that is neither cached nor inspectable
    /// has nothing to retract and yields an empty result.
    pub async fn unbalance(
        &self,
        id: &str,
        override_ip: Option<&str>,
    ) -> Result<Unbalanced, SyncError> {
        if id.is_empty() {
            return Err(SyncError::MissingId);
        }

        let lock = self.lock_for(id);
        let result = match &lock {
            Some(lock) => {
                let _held = lock.lock().await;
                self.retract_all(id, override_ip).await
            }
            None => self.retract_all(id, override_ip).await,
        };
        self.release_lock(id, lock);
        Ok(result)
    }

    async fn publish(&self, id: &str, override_ip: Option<&str>) -> Result<Balanced, SyncError> {
        let descriptor = self.runtime.inspect(id).await?;
        let routes = self.resolver.resolve(&descriptor, override_ip)?;
        self.cache.insert(id, routes.clone());

        let results = join_all(routes.iter().map(|(vhost, addresses)| async move {
            let outcome = self
                .store
                .add(vhost, addresses)
                .await
                .map(|()| addresses.len());
            if let Err(e) = &outcome {
                warn!(container_id = id, vhost = %vhost, error = %e, "Failed to publish backends");
            }
            VhostResult {
                vhost: vhost.clone(),
                outcome,
            }
        }))
        .await;

        tokio::time::sleep(self.settle_interval).await;

        info!(
            container_id = id,
            name = %descriptor.name,
            vhosts = ?routes.keys().collect::<Vec<_>>(),
            "Container balanced"
        );
        let _ = self.events.send(SyncEvent::Balance {
            id: id.to_string(),
            routes: routes.clone(),
        });

        Ok(Balanced {
            id: id.to_string(),
            routes,
            results,
        })
    }

    async fn retract_all(&self, id: &str, override_ip: Option<&str>) -> Unbalanced {
        let routes = match self.cache.take(id) {
            Some(routes) => routes,
            None => self.resolve_uncached(id, override_ip).await,
        };

        let results = join_all(
            routes
                .iter()
                .map(|(vhost, addresses)| self.retract(id, vhost, addresses)),
        )
        .await;

        tokio::time::sleep(self.settle_interval).await;

        info!(container_id = id, vhosts = results.len(), "Container unbalanced");
        let _ = self.events.send(SyncEvent::Unbalance {
            id: id.to_string(),
            results: results.clone(),
        });

        Unbalanced {
            id: id.to_string(),
            results,
        }
    }

    async fn resolve_uncached(&self, id: &str, override_ip: Option<&str>) -> ResolvedRoute {
        let resolved = match self.runtime.inspect(id).await {
            Ok(descriptor) => self.resolver.resolve(&descriptor, override_ip),
            Err(e) => Err(e),
        };
        match resolved {
            Ok(routes) => routes,
            Err(e) => {
                debug!(container_id = id, error = %e, "Nothing to retract");
                ResolvedRoute::new()
            }
        }
    }

    /// Remove `addresses` from `vhost`, deleting the list once only the
    /// reserved placeholder is left
    async fn retract(&self, id: &str, vhost: &str, addresses: &[String]) -> VhostResult {
        let outcome = self.store.remove(vhost, addresses).await;
        if let Err(e) = &outcome {
            warn!(container_id = id, vhost, error = %e, "Failed to retract backends");
        }

        match self.store.find(vhost).await {
            Ok(remaining) if remaining.len() == RESERVED_ENTRIES => {
                match self.store.remove_all(vhost).await {
                    Ok(()) => debug!(vhost, "Removed empty frontend"),
                    Err(e) => warn!(vhost, error = %e, "Failed to remove empty frontend"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(vhost, error = %e, "Failed to read frontend after retract"),
        }

        VhostResult {
            vhost: vhost.to_string(),
            outcome,
        }
    }

    fn lock_for(&self, id: &str) -> Option<Arc<Mutex<()>>> {
        self.locks
            .as_ref()
            .map(|locks| Arc::clone(locks.entry(id.to_string()).or_default().value()))
    }

    /// Drop the lock entry for `id` unless another operation holds or
    /// awaits it
    fn release_lock(&self, id: &str, lock: Option<Arc<Mutex<()>>>) {
        if let (Some(locks), Some(lock)) = (&self.locks, lock) {
            drop(lock);
            locks.remove_if(id, |_, l| Arc::strong_count(l) == 1);
        }
    }
}
