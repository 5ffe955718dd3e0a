// src/controller/mod.rs

//! Transaction controller
//!
//! Runs the reconciler continuously:
//! 1. A poller lists Transactions every `poll_interval` and queues the ones
//!    that are not finished
//! 2. `workers` tasks take names off the [`WorkQueue`] and reconcile them on
//!    the blocking thread pool (store and artifact I/O are synchronous)
//! 3. Blocked transactions are queued again after `blocked_requeue`; failed
//!    passes back off exponentially, capped at `max_backoff`
//!
//! Sending `true` on the shutdown channel stops the poller and lets each
//! worker finish its current pass before exiting.

mod queue;

pub use queue::WorkQueue;

use crate::config::Config;
use crate::db::models::TransactionSpec;
use crate::db::{LabelSelector, ObjectStore, StoreExt};
use crate::error::Result;
use crate::packages::ArtifactFetcher;
use crate::transaction::TransactionReconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    /// First retry delay after a failed pass
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

pub struct Controller {
    store: Arc<dyn ObjectStore>,
    reconciler: Arc<TransactionReconciler>,
    queue: Arc<WorkQueue>,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        reconciler: TransactionReconciler,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            reconciler: Arc::new(reconciler),
            queue: Arc::new(WorkQueue::new()),
            settings,
        }
    }

    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: &Config,
    ) -> Result<Self> {
        let reconciler = TransactionReconciler::from_config(store.clone(), fetcher, config)?;
        let settings = ControllerSettings {
            workers: config.workers,
            poll_interval: config.poll_interval(),
            max_backoff: config.max_backoff(),
            ..Default::default()
        };
        Ok(Self::new(store, reconciler, settings))
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Run until `shutdown` turns true
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(
            "Starting controller with {} workers, polling every {:?}",
            self.settings.workers, self.settings.poll_interval
        );

        let mut handles = Vec::with_capacity(self.settings.workers + 1);
        handles.push(tokio::spawn(poll_loop(
            self.store.clone(),
            self.queue.clone(),
            self.settings.poll_interval,
            shutdown.clone(),
        )));
        for id in 0..self.settings.workers {
            handles.push(tokio::spawn(worker_loop(
                id,
                self.reconciler.clone(),
                self.queue.clone(),
                self.settings,
                shutdown.clone(),
            )));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Controller task panicked: {}", e);
            }
        }
        info!("Controller stopped");
    }
}

fn is_stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Names of transactions that still need work
fn unfinished_transactions(store: &dyn ObjectStore) -> Result<Vec<String>> {
    Ok(store
        .list_objects::<TransactionSpec>(&LabelSelector::everything())?
        .into_iter()
        .filter(|tx| !tx.status.phase.is_terminal() && !tx.is_deleting())
        .map(|tx| tx.name().to_string())
        .collect())
}

async fn poll_loop(
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    while !is_stopping(&shutdown) {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let store = store.clone();
        match tokio::task::spawn_blocking(move || unfinished_transactions(store.as_ref())).await {
            Ok(Ok(names)) => {
                for name in names {
                    queue.add(&name).await;
                }
            }
            Ok(Err(e)) => warn!("Failed to list transactions: {}", e),
            Err(e) => error!("Transaction listing task failed: {}", e),
        }
    }
    debug!("Poller stopped");
}

async fn worker_loop(
    id: usize,
    reconciler: Arc<TransactionReconciler>,
    queue: Arc<WorkQueue>,
    settings: ControllerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    while !is_stopping(&shutdown) {
        let name = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            name = queue.next() => name,
        };

        debug!(worker = id, transaction = %name, "Reconciling");
        let task = {
            let reconciler = reconciler.clone();
            let name = name.clone();
            tokio::task::spawn_blocking(move || reconciler.reconcile(&name))
        };

        match task.await {
            Ok(Ok(outcome)) => {
                queue.forget(&name).await;
                if let Some(delay) = outcome.requeue_after {
                    queue.add_after(name.clone(), delay);
                }
            }
            Ok(Err(e)) if e.is_conflict() => {
                debug!(transaction = %name, "Conflict, retrying: {}", e);
                queue.add_after(name.clone(), settings.base_backoff);
            }
            Ok(Err(e)) => {
                let delay = queue
                    .backoff(&name, settings.base_backoff, settings.max_backoff)
                    .await;
                warn!(
                    transaction = %name,
                    "Reconcile failed, retrying in {:?}: {}", delay, e
                );
                queue.add_after(name.clone(), delay);
            }
            Err(e) => error!(transaction = %name, "Reconcile task panicked: {}", e),
        }
        queue.done(&name).await;
    }
    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::db::models::{PackageSnapshot, Transaction, TransactionPhase};
    use crate::packages::{ArtifactBuilder, MemoryFetcher};

    fn fast_settings() -> ControllerSettings {
        ControllerSettings {
            workers: 2,
            poll_interval: Duration::from_millis(10),
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_unfinished_transactions_skips_terminal() {
        let store = MemoryStore::new();
        store
            .create_object(&Transaction::new("open", TransactionSpec::default()))
            .unwrap();
        let mut done = store
            .create_object(&Transaction::new("done", TransactionSpec::default()))
            .unwrap();
        done.status.phase = TransactionPhase::Complete;
        store.update_object_status(&done).unwrap();

        assert_eq!(unfinished_transactions(&store).unwrap(), vec!["open".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_controller_completes_transaction() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.publish(ArtifactBuilder::new("acme/a", "a", "v1.0.0").build());
        store
            .create_object(&Transaction::new(
                "install-a",
                TransactionSpec::install(PackageSnapshot {
                    name: "a".to_string(),
                    source: "acme/a".to_string(),
                    version: "v1.0.0".to_string(),
                }),
            ))
            .unwrap();

        let reconciler =
            TransactionReconciler::from_config(store.clone(), fetcher, &Config::default()).unwrap();
        let controller = Controller::new(store.clone(), reconciler, fast_settings());
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(controller.run(shutdown));

        let mut phase = TransactionPhase::Pending;
        for _ in 0..200 {
            phase = store
                .get_object::<TransactionSpec>("install-a")
                .unwrap()
                .status
                .phase;
            if phase.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(phase, TransactionPhase::Complete);

        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }
}
