//! The pod-local copy of the shard-to-pod assignment.
//!
//! Two writers feed it: the refresh pipeline (shard manager snapshots and
//! the storage change stream) and direct assign/unassign calls from the
//! shard manager. The change stream carries peer information only; it can
//! never grant or revoke this pod's own ownership.

use crate::metrics;
use crate::types::{PodAddress, ShardId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::watch;

/// Narrow view of shard ownership handed to the entity layer. Entity
/// managers consult it on every send; routing owns the full table.
pub(crate) trait ShardView: Send + Sync + 'static {
    fn owns_shard(&self, shard: ShardId) -> bool;
    fn is_shutting_down(&self) -> bool;
}

pub(crate) struct AssignmentTable {
    self_address: PodAddress,
    shards: RwLock<HashMap<ShardId, PodAddress>>,
    shutting_down: AtomicBool,
    // Latch: flips to true once the first authoritative snapshot landed.
    ready: watch::Sender<bool>,
}

impl AssignmentTable {
    pub fn new(self_address: PodAddress) -> Self {
        Self {
            self_address,
            shards: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            ready: watch::Sender::new(false),
        }
    }

    pub fn pod_for(&self, shard: ShardId) -> Option<PodAddress> {
        self.shards.read().unwrap().get(&shard).cloned()
    }

    pub fn snapshot(&self) -> HashMap<ShardId, PodAddress> {
        self.shards.read().unwrap().clone()
    }

    /// Distinct addresses of every pod currently holding shards.
    pub fn pods(&self) -> BTreeSet<PodAddress> {
        self.shards.read().unwrap().values().cloned().collect()
    }

    pub fn owned_shards(&self) -> BTreeSet<ShardId> {
        self.shards
            .read()
            .unwrap()
            .iter()
            .filter(|(_, pod)| **pod == self.self_address)
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Install an authoritative snapshot, replacing the whole table.
    pub fn replace(&self, assignments: HashMap<ShardId, Option<PodAddress>>) {
        let mut shards = self.shards.write().unwrap();
        *shards = assignments
            .into_iter()
            .filter_map(|(shard, pod)| pod.map(|pod| (shard, pod)))
            .collect();
        self.update_gauge(&shards);
        tracing::debug!(assigned = shards.len(), "installed assignment snapshot");
    }

    /// Merge a change-stream event: peer entries are taken from the event,
    /// entries owned by this pod are kept from local state.
    pub fn merge_event(&self, event: HashMap<ShardId, Option<PodAddress>>) {
        let mut shards = self.shards.write().unwrap();
        let mut next: HashMap<ShardId, PodAddress> = event
            .into_iter()
            .filter_map(|(shard, pod)| match pod {
                Some(pod) if pod != self.self_address => Some((shard, pod)),
                _ => None,
            })
            .collect();
        for (shard, pod) in shards.iter() {
            if *pod == self.self_address {
                next.insert(*shard, pod.clone());
            }
        }
        *shards = next;
        self.update_gauge(&shards);
    }

    pub fn assign(&self, to_assign: &BTreeSet<ShardId>) {
        let mut shards = self.shards.write().unwrap();
        for shard in to_assign {
            shards.insert(*shard, self.self_address.clone());
        }
        self.update_gauge(&shards);
    }

    /// Remove entries among `to_unassign` that are currently owned here.
    pub fn unassign(&self, to_unassign: &BTreeSet<ShardId>) {
        let mut shards = self.shards.write().unwrap();
        for shard in to_unassign {
            if shards.get(shard) == Some(&self.self_address) {
                shards.remove(shard);
            }
        }
        self.update_gauge(&shards);
    }

    fn update_gauge(&self, shards: &HashMap<ShardId, PodAddress>) {
        let owned = shards
            .values()
            .filter(|pod| **pod == self.self_address)
            .count();
        metrics::shards().set(owned as f64);
    }

    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Waits until the first snapshot has been installed.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Returns whether the flag was already set.
    pub fn set_shutting_down(&self) -> bool {
        self.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn owns_shard(&self, shard: ShardId) -> bool {
        self.shards.read().unwrap().get(&shard) == Some(&self.self_address)
    }
}

impl ShardView for AssignmentTable {
    fn owns_shard(&self, shard: ShardId) -> bool {
        AssignmentTable::owns_shard(self, shard)
    }

    fn is_shutting_down(&self) -> bool {
        AssignmentTable::is_shutting_down(self)
    }
}
