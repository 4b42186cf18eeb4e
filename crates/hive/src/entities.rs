//! Entity lifecycle: one manager per recipient type owns the mailboxes of
//! its live entities, starts them on demand, expires them when idle and
//! shuts them down when their shards move away or the pod drains.

use crate::assignment::ShardView;
use crate::codec::{self, Wire};
use crate::metrics;
use crate::reply::SendChannel;
use crate::types::{RecipientKind, ShardId};
use crate::Error;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;

/// Backoff while an entity is terminating or its mailbox closed mid-send.
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// The FIFO input queue of one entity. `recv()` yielding `None` means the
/// mailbox was closed and the behavior task should exit.
pub type Mailbox<M> = mpsc::UnboundedReceiver<M>;

pub(crate) type Behavior<M> =
    Arc<dyn Fn(String, Mailbox<M>) -> BoxFuture<'static, ()> + Send + Sync>;

type TerminationSignal = Shared<BoxFuture<'static, ()>>;

/// Completion handle carried by a graceful-termination message. The entity
/// calls [`TerminationAck::done`] once it has finished draining; dropping
/// the last clone signals completion as well, so an entity that exits
/// without acking still unblocks the drain.
#[derive(Clone)]
pub struct TerminationAck {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl TerminationAck {
    fn new(tx: oneshot::Sender<()>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Signal that the entity has finished shutting down.
    pub fn done(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// A detached ack; signaling it is a no-op. This is also what a terminate
/// message deserializes to, should one ever be rebuilt from the wire.
impl Default for TerminationAck {
    fn default() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }
}

impl std::fmt::Debug for TerminationAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TerminationAck")
    }
}

impl serde::Serialize for TerminationAck {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit()
    }
}

impl<'de> serde::Deserialize<'de> for TerminationAck {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let _ = serde::de::IgnoredAny::deserialize(deserializer)?;
        Ok(Self::default())
    }
}

/// Registration options of one recipient type.
pub struct EntityOptions<M> {
    /// Builds the message asking an entity to shut down gracefully. When
    /// absent, termination closes the mailbox immediately instead.
    pub terminate_message: Option<Arc<dyn Fn(TerminationAck) -> M + Send + Sync>>,
    /// Overrides `Config::entity_max_idle_time` for this type.
    pub max_idle: Option<Duration>,
}

impl<M> Default for EntityOptions<M> {
    fn default() -> Self {
        Self {
            terminate_message: None,
            max_idle: None,
        }
    }
}

impl<M> EntityOptions<M> {
    pub fn with_terminate_message(
        mut self,
        factory: impl Fn(TerminationAck) -> M + Send + Sync + 'static,
    ) -> Self {
        self.terminate_message = Some(Arc::new(factory));
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }
}

enum SlotState<M> {
    Active(mpsc::UnboundedSender<M>),
    Terminating(TerminationSignal),
}

impl<M> Clone for SlotState<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Active(tx) => Self::Active(tx.clone()),
            Self::Terminating(signal) => Self::Terminating(signal.clone()),
        }
    }
}

struct Slot<M> {
    // Guards teardown against a newer incarnation under the same ID.
    gen: u64,
    state: SlotState<M>,
}

struct ManagerInner<M: Wire> {
    type_name: String,
    kind: RecipientKind,
    behavior: Behavior<M>,
    terminate_message: Option<Arc<dyn Fn(TerminationAck) -> M + Send + Sync>>,
    shard_of: Arc<dyn Fn(&str) -> ShardId + Send + Sync>,
    shards: Arc<dyn ShardView>,
    // Slot updates suspend (they spawn tasks), so they serialize on the
    // write half; sends take read snapshots.
    entities: RwLock<HashMap<String, Slot<M>>>,
    last_received: Mutex<HashMap<String, Instant>>,
    max_idle: Duration,
    termination_timeout: Duration,
    generations: AtomicU64,
}

/// Mailbox owner for one recipient type.
pub(crate) struct EntityManager<M: Wire> {
    inner: Arc<ManagerInner<M>>,
}

impl<M: Wire> Clone for EntityManager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Wire> EntityManager<M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        type_name: String,
        kind: RecipientKind,
        behavior: Behavior<M>,
        options: EntityOptions<M>,
        shard_of: Arc<dyn Fn(&str) -> ShardId + Send + Sync>,
        shards: Arc<dyn ShardView>,
        default_max_idle: Duration,
        termination_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                type_name,
                kind,
                behavior,
                terminate_message: options.terminate_message,
                shard_of,
                shards,
                entities: RwLock::new(HashMap::new()),
                last_received: Mutex::new(HashMap::new()),
                max_idle: options.max_idle.unwrap_or(default_max_idle),
                termination_timeout,
                generations: AtomicU64::new(0),
            }),
        }
    }

    fn touch(&self, entity_id: &str) {
        self.inner
            .last_received
            .lock()
            .unwrap()
            .insert(entity_id.to_string(), Instant::now());
    }

    fn last_received(&self, entity_id: &str) -> Option<Instant> {
        self.inner.last_received.lock().unwrap().get(entity_id).copied()
    }

    /// Enqueue one message, starting the entity if needed. Retries with
    /// backoff around termination races; the only surfaced error is
    /// `EntityNotManagedByThisPod`.
    pub(crate) async fn send_single(&self, entity_id: &str, message: M) -> crate::Result<()> {
        loop {
            if self.inner.kind == RecipientKind::Entity
                && !self.inner.shards.owns_shard((self.inner.shard_of)(entity_id))
            {
                return Err(Error::EntityNotManagedByThisPod(entity_id.to_string()));
            }

            match self.slot(entity_id).await? {
                SlotState::Active(tx) => {
                    self.touch(entity_id);
                    if tx.send(message.clone()).is_ok() {
                        return Ok(());
                    }
                    // Mailbox closed by a concurrent shutdown; back off and
                    // resolve the slot again.
                }
                SlotState::Terminating(_) => {}
            }
            tokio::time::sleep(SEND_RETRY_BACKOFF).await;
        }
    }

    /// Deliver a whole send channel: one enqueue, or one per stream element.
    pub(crate) async fn send_channel(
        &self,
        entity_id: &str,
        message: SendChannel<M>,
    ) -> crate::Result<()> {
        match message {
            SendChannel::Single(m) => self.send_single(entity_id, m).await,
            SendChannel::Stream(factory) => {
                let mut stream = factory();
                while let Some(m) = stream.next().await {
                    self.send_single(entity_id, m).await?;
                }
                Ok(())
            }
        }
    }

    async fn slot(&self, entity_id: &str) -> crate::Result<SlotState<M>> {
        if let Some(slot) = self.inner.entities.read().await.get(entity_id) {
            return Ok(slot.state.clone());
        }

        let mut entities = self.inner.entities.write().await;
        if let Some(slot) = entities.get(entity_id) {
            return Ok(slot.state.clone());
        }
        // New entities are not started while the pod drains; topics still
        // accept subscribers.
        if self.inner.kind == RecipientKind::Entity && self.inner.shards.is_shutting_down() {
            return Err(Error::EntityNotManagedByThisPod(entity_id.to_string()));
        }
        Ok(self.start_entity(&mut entities, entity_id))
    }

    fn start_entity(
        &self,
        entities: &mut HashMap<String, Slot<M>>,
        entity_id: &str,
    ) -> SlotState<M> {
        let gen = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::debug!(
            recipient_type = %self.inner.type_name,
            entity_id,
            "starting entity"
        );
        metrics::entities(&self.inner.type_name).increment(1.0);
        self.touch(entity_id);

        let behavior = tokio::spawn((self.inner.behavior)(entity_id.to_string(), rx));
        let expiration = tokio::spawn({
            let mgr = self.clone();
            let id = entity_id.to_string();
            async move { mgr.expiration_loop(&id).await }
        });

        // Supervision: whenever and however the behavior exits, tear down
        // this generation's slot and bookkeeping.
        tokio::spawn({
            let mgr = self.clone();
            let id = entity_id.to_string();
            let expiration = expiration.abort_handle();
            async move {
                if let Err(err) = behavior.await {
                    if err.is_panic() {
                        tracing::error!(
                            recipient_type = %mgr.inner.type_name,
                            entity_id = %id,
                            "entity behavior panicked"
                        );
                    }
                }
                expiration.abort();
                mgr.finish_entity(&id, gen).await;
            }
        });

        let state = SlotState::Active(tx);
        entities.insert(
            entity_id.to_string(),
            Slot {
                gen,
                state: state.clone(),
            },
        );
        state
    }

    async fn finish_entity(&self, entity_id: &str, gen: u64) {
        let mut entities = self.inner.entities.write().await;
        let last_incarnation = match entities.get(entity_id) {
            Some(slot) if slot.gen == gen => {
                entities.remove(entity_id);
                true
            }
            // A newer incarnation owns the slot now.
            Some(_) => false,
            None => true,
        };
        drop(entities);

        if last_incarnation {
            self.inner.last_received.lock().unwrap().remove(entity_id);
        }
        metrics::entities(&self.inner.type_name).decrement(1.0);
        tracing::debug!(
            recipient_type = %self.inner.type_name,
            entity_id,
            "entity terminated"
        );
    }

    async fn expiration_loop(&self, entity_id: &str) {
        let max_idle = self.inner.max_idle;
        let mut wait = max_idle;
        loop {
            tokio::time::sleep(wait).await;
            match self.last_received(entity_id).map(|at| at.elapsed()) {
                Some(idle) if idle < max_idle => wait = max_idle - idle,
                _ => break,
            }
        }
        tracing::debug!(
            recipient_type = %self.inner.type_name,
            entity_id,
            "entity exceeded its idle time; terminating"
        );
        // Detached, so the shutdown this triggers cannot abort us mid-flight.
        tokio::spawn({
            let mgr = self.clone();
            let id = entity_id.to_string();
            async move { mgr.terminate_entity(&id).await }
        });
    }

    /// Ask one entity to shut down. Infallible; missing or already
    /// terminating entities are a no-op.
    pub(crate) async fn terminate_entity(&self, entity_id: &str) {
        let mut entities = self.inner.entities.write().await;
        self.begin_termination(&mut entities, entity_id);
    }

    fn begin_termination(
        &self,
        entities: &mut HashMap<String, Slot<M>>,
        entity_id: &str,
    ) -> Option<TerminationSignal> {
        let slot = entities.get(entity_id)?;
        let (gen, tx) = match &slot.state {
            SlotState::Active(tx) => (slot.gen, tx.clone()),
            SlotState::Terminating(_) => return None,
        };

        match &self.inner.terminate_message {
            Some(factory) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                let message = factory(TerminationAck::new(ack_tx));
                // Best effort: a mailbox closed by a concurrent exit is
                // already shutting down.
                let _ = tx.send(message);
                let signal: TerminationSignal = ack_rx.map(|_| ()).boxed().shared();
                entities.insert(
                    entity_id.to_string(),
                    Slot {
                        gen,
                        state: SlotState::Terminating(signal.clone()),
                    },
                );
                Some(signal)
            }
            None => {
                // Hard shutdown: close the mailbox by dropping the slot's
                // sender. The behavior drains what was already enqueued,
                // then observes `None` and exits.
                entities.remove(entity_id);
                None
            }
        }
    }

    pub(crate) async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>) {
        let mut entities = self.inner.entities.write().await;
        let targets: Vec<String> = entities
            .keys()
            .filter(|id| shards.contains(&(self.inner.shard_of)(id)))
            .cloned()
            .collect();
        let signals: Vec<_> = targets
            .iter()
            .filter_map(|id| self.begin_termination(&mut entities, id))
            .collect();
        drop(entities);
        self.await_drain(signals).await;
    }

    pub(crate) async fn terminate_all(&self) {
        let mut entities = self.inner.entities.write().await;
        let targets: Vec<String> = entities.keys().cloned().collect();
        let signals: Vec<_> = targets
            .iter()
            .filter_map(|id| self.begin_termination(&mut entities, id))
            .collect();
        drop(entities);
        self.await_drain(signals).await;
    }

    async fn await_drain(&self, signals: Vec<TerminationSignal>) {
        if signals.is_empty() {
            return;
        }
        let count = signals.len();
        let drained = tokio::time::timeout(
            self.inner.termination_timeout,
            futures::future::join_all(signals),
        )
        .await;
        if drained.is_err() {
            tracing::warn!(
                recipient_type = %self.inner.type_name,
                count,
                "timed out waiting for entities to drain; abandoning them"
            );
        }
    }

    #[cfg(test)]
    async fn live_entities(&self) -> usize {
        self.inner.entities.read().await.len()
    }
}

/// Type-erased face of an [`EntityManager`], held by the router. The typed
/// manager is recovered by downcast on the local fast path.
#[async_trait::async_trait]
pub(crate) trait RecipientManager: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Decode one wire body and enqueue it.
    async fn deliver_binary_single(&self, entity_id: &str, body: &[u8]) -> crate::Result<()>;

    async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>);

    async fn terminate_all(&self);
}

#[async_trait::async_trait]
impl<M: Wire> RecipientManager for EntityManager<M> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn deliver_binary_single(&self, entity_id: &str, body: &[u8]) -> crate::Result<()> {
        let message: M = codec::decode(body)?;
        self.send_single(entity_id, message).await
    }

    async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>) {
        EntityManager::terminate_entities_on_shards(self, shards).await;
    }

    async fn terminate_all(&self) {
        EntityManager::terminate_all(self).await;
    }
}
