//! Cluster singletons: named long-running tasks that must run on exactly
//! one pod, pinned to whichever pod owns the sentinel shard.

use crate::metrics;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// The leader token: singletons run wherever this shard is assigned.
pub const SINGLETON_SHARD: crate::ShardId = 1;

struct SingletonRecord {
    name: String,
    run: Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
    // Present iff the singleton currently runs on this pod.
    handle: Option<AbortHandle>,
}

/// Registered singletons and their running state. Reconciliation serializes
/// on the records lock, so concurrent assignment events cannot double-start
/// a task.
#[derive(Default)]
pub(crate) struct SingletonController {
    records: Mutex<Vec<SingletonRecord>>,
}

impl SingletonController {
    /// Record a singleton. Whether it starts is decided by the next
    /// reconcile.
    pub async fn register(
        &self,
        name: String,
        run: Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
    ) {
        let mut records = self.records.lock().await;
        metrics::singleton(&name).set(0.0);
        records.push(SingletonRecord {
            name,
            run,
            handle: None,
        });
    }

    /// Drive every record to the desired state: all running when this pod
    /// holds the sentinel shard, all stopped otherwise.
    pub async fn reconcile(&self, should_run: bool) {
        let mut records = self.records.lock().await;
        for record in records.iter_mut() {
            match (&record.handle, should_run) {
                (None, true) => {
                    tracing::info!(singleton = %record.name, "starting singleton");
                    let task = tokio::spawn((record.run)());
                    record.handle = Some(task.abort_handle());
                    metrics::singleton(&record.name).set(1.0);
                }
                (Some(handle), false) => {
                    tracing::info!(singleton = %record.name, "stopping singleton");
                    handle.abort();
                    record.handle = None;
                    metrics::singleton(&record.name).set(0.0);
                }
                _ => {}
            }
        }
    }

    pub async fn stop_all(&self) {
        self.reconcile(false).await;
    }

    #[cfg(test)]
    pub async fn running(&self) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|record| record.handle.is_some())
            .count()
    }
}
