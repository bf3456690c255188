//! Lifecycle event dispatch
//!
//! Consumes the runtime's event stream and turns `start` into a balance and
//! `die` into an unbalance. Each event runs as its own task, so ordering
//! between events for the same container is only as good as the stream's
//! delivery order (plus per-container serialization, when enabled). Those
//! tasks are tracked so shutdown can wait for them.

use crate::docker::{ContainerEvent, SharedRuntime};
use crate::error::SyncError;
use crate::sync::Synchronizer;
use futures::future::join_all;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Wait before resubscribing after the event stream fails or ends
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

const STATUS_START: &str = "start";
const STATUS_DIE: &str = "die";

/// Outcome of a reconciliation sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Containers a balance was attempted for
    pub attempted: usize,
    /// Containers balanced successfully
    pub balanced: usize,
    /// Failed container ids with the error message
    pub failed: BTreeMap<String, String>,
}

/// A running listen loop and its stop signal
struct Listener {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Listener {
    /// Running and not asked to stop
    fn is_active(&self) -> bool {
        !self.handle.is_finished() && !*self.shutdown_tx.borrow()
    }
}

/// Routes lifecycle events to the synchronizer
pub struct Dispatcher {
    synchronizer: Arc<Synchronizer>,
    runtime: SharedRuntime,
    listener: Mutex<Option<Listener>>,
    /// Balance/unbalance tasks spawned for events
    operations: Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(synchronizer: Arc<Synchronizer>) -> Arc<Self> {
        let runtime = Arc::clone(synchronizer.runtime());
        Arc::new(Self {
            synchronizer,
            runtime,
            listener: Mutex::new(None),
            operations: Mutex::new(JoinSet::new()),
        })
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    /// Start consuming events. Does nothing if already listening.
    ///
    /// A loop still winding down after `stop` is replaced by a fresh one.
    pub fn start(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.as_ref().is_some_and(Listener::is_active) {
            debug!("Event dispatcher already running");
            return;
        }

        // Replacing the previous listener drops its sender, which ends its loop
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            dispatcher.listen(shutdown_rx).await;
        });
        *listener = Some(Listener {
            handle,
            shutdown_tx,
        });
    }

    /// Stop consuming events. Operations already started run to completion;
    /// see [`Dispatcher::wait_idle`]
    pub fn stop(&self) {
        if let Some(listener) = self.listener.lock().as_ref() {
            listener.shutdown_tx.send_replace(true);
            info!("Event dispatcher stopping");
        }
    }

    /// Whether a listen loop is currently running
    pub fn is_running(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|l| !l.handle.is_finished())
    }

    /// Wait for every operation dispatched so far to finish.
    ///
    /// Returns `false` if `timeout` elapsed first; the remaining operations
    /// keep running in the background.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut pending = std::mem::take(&mut *self.operations.lock());
        let count = pending.len();

        let finished = tokio::time::timeout(timeout, async {
            while let Some(result) = pending.join_next().await {
                log_join_error(result);
            }
        })
        .await
        .is_ok();

        if !finished {
            warn!(remaining = pending.len(), "Sync operations still running");
            pending.detach_all();
        } else if count > 0 {
            debug!(operations = count, "Sync operations finished");
        }
        finished
    }

    async fn listen(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let mut events = self.runtime.events();
            info!("Listening for container events");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Event dispatcher stopped");
                            return;
                        }
                    }
                    next = events.next() => {
                        match next {
                            Some(Ok(event)) => {
                                self.handle(event);
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "Container event stream failed");
                                break;
                            }
                            None => {
                                warn!("Container event stream ended");
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Event dispatcher stopped");
                        return;
                    }
                }
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    }

    /// Dispatch a single event.
    ///
    /// Returns whether an operation was started; events whose status is
    /// neither `start` nor `die` are ignored.
    pub fn handle(&self, event: ContainerEvent) -> bool {
        let Some(status) = event.status.as_deref() else {
            return false;
        };
        if status != STATUS_START && status != STATUS_DIE {
            return false;
        }

        debug!(status, container_id = %event.id, node_ip = ?event.node_ip, "Container event");
        let synchronizer = Arc::clone(&self.synchronizer);
        let starting = status == STATUS_START;

        let mut operations = self.operations.lock();
        while let Some(result) = operations.try_join_next() {
            log_join_error(result);
        }
        operations.spawn(async move {
            let id = event.id.as_str();
            let node_ip = event.node_ip.as_deref();
            if starting {
                match synchronizer.balance(id, node_ip).await {
                    Ok(balanced) => {
                        let failed = balanced.failures().count();
                        if failed > 0 {
                            warn!(container_id = id, failed, "Some virtual hosts were not published");
                        }
                    }
                    Err(e) => {
                        warn!(container_id = id, error = %e, "Skipping balance");
                    }
                }
            } else if let Err(e) = synchronizer.unbalance(id, node_ip).await {
                warn!(container_id = id, error = %e, "Skipping unbalance");
            }
        });
        true
    }

    /// Balance every running container once.
    ///
    /// Routes of containers that are no longer running are not retracted.
    pub async fn sync(&self) -> Result<SyncReport, SyncError> {
        let ids = self.runtime.list_running().await?;
        info!(containers = ids.len(), "Reconciling running containers");

        let results = join_all(ids.iter().map(|id| self.synchronizer.balance(id, None))).await;

        let mut report = SyncReport {
            attempted: ids.len(),
            ..Default::default()
        };
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(_) => report.balanced += 1,
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Reconcile failed for container");
                    report.failed.insert(id.clone(), e.to_string());
                }
            }
        }

        info!(
            attempted = report.attempted,
            balanced = report.balanced,
            failed = report.failed.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Sync operation task failed");
    }
}
