//! The sharding router: resolves the owning pod of every send, delivers
//! locally or through the transport, retries while routing is stale, and
//! hosts the pod lifecycle (register, refresh, drain).

use crate::assignment::AssignmentTable;
use crate::codec::{self, Wire};
use crate::config::Config;
use crate::entities::{EntityManager, EntityOptions, Mailbox, RecipientManager};
use crate::reply::{
    RegisteredReply, Replier, ReplyChannel, ReplyKind, ReplyRegistration, ReplyRegistry,
    SendChannel, StreamOutput, StreamReplier,
};
use crate::singleton::{SingletonController, SINGLETON_SHARD};
use crate::transport::{AssignmentStorage, Pods, ShardManagerClient};
use crate::types::{BinaryMessage, PodAddress, RecipientType, ShardId};
use crate::Error;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Future, Stream, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Backoff while an entity's shard has no assignment yet.
const UNASSIGNED_BACKOFF: Duration = Duration::from_millis(100);
/// Backoff after a send failed on stale routing or an unreachable pod.
const STALE_ROUTE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone)]
struct RegisteredRecipient {
    shard_of: Arc<dyn Fn(&str) -> ShardId + Send + Sync>,
    manager: Arc<dyn RecipientManager>,
}

struct Inner {
    config: Config,
    self_address: PodAddress,
    table: Arc<AssignmentTable>,
    recipients: RwLock<HashMap<String, RegisteredRecipient>>,
    replies: ReplyRegistry,
    singletons: SingletonController,
    shard_manager: Arc<dyn ShardManagerClient>,
    storage: Arc<dyn AssignmentStorage>,
    pods: Arc<dyn Pods>,
    started_at: Instant,
    // Millis-since-start of the last unhealthy-pod report, offset by one;
    // zero means none was made yet.
    last_unhealthy_report: AtomicU64,
    registered: AtomicBool,
    refresher: std::sync::Mutex<Option<AbortHandle>>,
}

/// Handle to the pod's sharding runtime. Cheap to clone; all clones share
/// one state.
#[derive(Clone)]
pub struct Sharding {
    inner: Arc<Inner>,
}

impl Sharding {
    pub fn new(
        config: Config,
        shard_manager: Arc<dyn ShardManagerClient>,
        storage: Arc<dyn AssignmentStorage>,
        pods: Arc<dyn Pods>,
    ) -> Self {
        let self_address = config.self_address();
        Self {
            inner: Arc::new(Inner {
                table: Arc::new(AssignmentTable::new(self_address.clone())),
                self_address,
                config,
                recipients: RwLock::new(HashMap::new()),
                replies: ReplyRegistry::default(),
                singletons: SingletonController::default(),
                shard_manager,
                storage,
                pods,
                started_at: Instant::now(),
                last_unhealthy_report: AtomicU64::new(0),
                registered: AtomicBool::new(false),
                refresher: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn self_address(&self) -> &PodAddress {
        &self.inner.self_address
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.table.is_shutting_down()
    }

    /// Snapshot of the local shard-to-pod table.
    pub fn assignments(&self) -> HashMap<ShardId, PodAddress> {
        self.inner.table.snapshot()
    }

    /// In-flight reply IDs registered on this pod.
    pub fn pending_replies(&self) -> usize {
        self.inner.replies.len()
    }

    // ---- recipient registration ------------------------------------------

    /// Host a recipient type on this pod. The behavior runs as one task per
    /// live entity, reading its mailbox until it closes.
    pub async fn register_entity<M: Wire>(
        &self,
        recipient: RecipientType<M>,
        behavior: impl Fn(String, Mailbox<M>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
        options: EntityOptions<M>,
    ) {
        let shard_of = recipient.shard_fn(self.inner.config.number_of_shards);
        let manager = EntityManager::new(
            recipient.name().to_string(),
            recipient.kind(),
            Arc::new(behavior),
            options,
            shard_of.clone(),
            self.inner.table.clone(),
            self.inner.config.entity_max_idle_time,
            self.inner.config.entity_termination_timeout,
        );
        self.inner.recipients.write().await.insert(
            recipient.name().to_string(),
            RegisteredRecipient {
                shard_of,
                manager: Arc::new(manager),
            },
        );
    }

    /// Host a topic on this pod; topic subscribers exist wherever messages
    /// were broadcast to, independent of shard ownership.
    pub async fn register_topic<M: Wire>(
        &self,
        recipient: RecipientType<M>,
        behavior: impl Fn(String, Mailbox<M>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
        options: EntityOptions<M>,
    ) {
        self.register_entity(recipient, behavior, options).await;
    }

    async fn recipient(&self, type_name: &str) -> crate::Result<RegisteredRecipient> {
        self.inner
            .recipients
            .read()
            .await
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::UnknownRecipientType(type_name.to_string()))
    }

    /// Point-to-point sender for an entity type, using the configured
    /// default timeout.
    pub fn messenger<M: Wire>(&self, recipient: RecipientType<M>) -> Messenger<M> {
        Messenger {
            sharding: self.clone(),
            timeout: self.inner.config.send_timeout,
            recipient,
        }
    }

    /// One-to-all-pods sender for a topic type.
    pub fn broadcaster<M: Wire>(&self, recipient: RecipientType<M>) -> Broadcaster<M> {
        Broadcaster {
            sharding: self.clone(),
            timeout: self.inner.config.send_timeout,
            recipient,
        }
    }

    // ---- pod lifecycle ---------------------------------------------------

    /// Register with the shard manager and start the assignment refresher.
    /// Resolves once the first assignment snapshot has been installed.
    /// Idempotent: later calls only wait for that snapshot.
    pub async fn register(&self) -> crate::Result<()> {
        if self.inner.registered.swap(true, Ordering::SeqCst) {
            self.inner.table.ready().await;
            return Ok(());
        }
        tracing::info!(pod = %self.inner.self_address, "registering pod with the shard manager");
        if let Err(err) = self
            .inner
            .shard_manager
            .register(self.inner.self_address.clone())
            .await
        {
            // Let the caller retry registration.
            self.inner.registered.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let refresher = tokio::spawn({
            let sharding = self.clone();
            async move { sharding.refresh_assignments().await }
        });
        *self.inner.refresher.lock().unwrap() = Some(refresher.abort_handle());

        self.inner.table.ready().await;
        Ok(())
    }

    async fn refresh_assignments(&self) {
        loop {
            if let Err(err) = self.refresh_pipeline().await {
                tracing::warn!(error = %err, "assignment refresh failed; will restart");
            }
            tokio::time::sleep(self.inner.config.refresh_assignments_retry_interval).await;
        }
    }

    async fn refresh_pipeline(&self) -> crate::Result<()> {
        // The shard manager's direct answer is authoritative and replaces
        // the table; change-stream events after it are peer information.
        let snapshot = self.inner.shard_manager.get_assignments().await?;
        self.inner.table.replace(snapshot);
        self.inner.table.mark_ready();
        self.reconcile_singletons().await;

        let mut changes = self.inner.storage.assignments_stream();
        while let Some(event) = changes.next().await {
            self.inner.table.merge_event(event?);
            self.reconcile_singletons().await;
        }
        // The change stream ended; restart the pipeline from a fresh snapshot.
        Ok(())
    }

    /// Drain this pod: no new entities start, existing ones are asked to
    /// stop, and the shard manager is told to reassign. Idempotent; a
    /// failure to reach the shard manager does not stop the local drain.
    pub async fn unregister(&self) -> crate::Result<()> {
        if self.inner.table.set_shutting_down() {
            return Ok(());
        }
        tracing::info!(pod = %self.inner.self_address, "unregistering pod and draining entities");

        if let Err(err) = self
            .inner
            .shard_manager
            .unregister(self.inner.self_address.clone())
            .await
        {
            tracing::warn!(error = %err, "failed to unregister from the shard manager; draining anyway");
        }
        if let Some(refresher) = self.inner.refresher.lock().unwrap().take() {
            refresher.abort();
        }
        self.inner.singletons.stop_all().await;

        let recipients: Vec<_> = self.inner.recipients.read().await.values().cloned().collect();
        futures::future::join_all(
            recipients
                .iter()
                .map(|recipient| recipient.manager.terminate_all()),
        )
        .await;
        Ok(())
    }

    // ---- assignment mutations from the shard manager ---------------------

    /// Invoked by the transport on an assign request from the shard manager.
    pub async fn assign_shards(&self, shards: BTreeSet<ShardId>) {
        if self.is_shutting_down() {
            // Draining pods take no new shards.
            return;
        }
        tracing::info!(?shards, "shards assigned to this pod");
        self.inner.table.assign(&shards);
        self.reconcile_singletons().await;
    }

    /// Invoked by the transport on an unassign request from the shard
    /// manager. Resolves only after entities on those shards were drained.
    pub async fn unassign_shards(&self, shards: BTreeSet<ShardId>) {
        tracing::info!(?shards, "shards unassigned from this pod");
        self.inner.table.unassign(&shards);

        let recipients: Vec<_> = self.inner.recipients.read().await.values().cloned().collect();
        futures::future::join_all(
            recipients
                .iter()
                .map(|recipient| recipient.manager.terminate_entities_on_shards(&shards)),
        )
        .await;
        self.reconcile_singletons().await;
    }

    // ---- singletons ------------------------------------------------------

    /// Register a task that must run on exactly one pod cluster-wide. It is
    /// started here whenever this pod owns the sentinel shard.
    pub async fn register_singleton(
        &self,
        name: impl Into<String>,
        run: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        self.inner.singletons.register(name.into(), Arc::new(run)).await;
        self.reconcile_singletons().await;
    }

    async fn reconcile_singletons(&self) {
        let leader =
            self.inner.table.pod_for(SINGLETON_SHARD).as_ref() == Some(&self.inner.self_address);
        self.inner
            .singletons
            .reconcile(leader && !self.is_shutting_down())
            .await;
    }

    // ---- replies ---------------------------------------------------------

    fn register_reply<R: Wire>(
        &self,
        reply_id: &str,
        reply: &ReplyChannel<R>,
    ) -> ReplyRegistration {
        self.inner.replies.insert(
            reply_id.to_string(),
            RegisteredReply::Typed(Box::new(reply.clone())),
        )
    }

    /// Resolve a reply ID to its channel and complete it with one value.
    /// Replies to already-completed channels are dropped.
    pub(crate) async fn reply_single_to<R: Wire>(
        &self,
        reply_id: &str,
        value: R,
    ) -> crate::Result<()> {
        match self.inner.replies.take(reply_id) {
            None => {
                tracing::debug!(reply_id, "dropping reply to an already-completed channel");
                Ok(())
            }
            Some(RegisteredReply::Typed(any)) => match any.downcast::<ReplyChannel<R>>() {
                Ok(reply) => {
                    reply.reply_single(value);
                    Ok(())
                }
                Err(_) => Err(Error::ReplyTypeMismatch(reply_id.to_string())),
            },
            Some(RegisteredReply::Binary(reply)) => {
                reply.reply_single(codec::encode(&value)?);
                Ok(())
            }
        }
    }

    /// Resolve a reply ID to its channel and stream chunks into it.
    pub(crate) async fn reply_stream_to<R: Wire>(
        &self,
        reply_id: &str,
        source: BoxStream<'static, crate::Result<R>>,
    ) -> crate::Result<()> {
        match self.inner.replies.take(reply_id) {
            None => {
                tracing::debug!(reply_id, "dropping reply stream to an already-completed channel");
                Ok(())
            }
            Some(RegisteredReply::Typed(any)) => match any.downcast::<ReplyChannel<R>>() {
                Ok(reply) => {
                    reply.reply_stream(source).await;
                    Ok(())
                }
                Err(_) => Err(Error::ReplyTypeMismatch(reply_id.to_string())),
            },
            Some(RegisteredReply::Binary(reply)) => {
                let encoded = source.map(|chunk| chunk.and_then(|value| codec::encode(&value)));
                reply.reply_stream(encoded.boxed()).await;
                Ok(())
            }
        }
    }

    // ---- send path -------------------------------------------------------

    /// Resolve-and-dispatch loop shared by every messenger shape. Transient
    /// routing errors retry here; everything else fails the reply channel
    /// and surfaces.
    pub(crate) async fn send_typed<M: Wire, R: Wire>(
        &self,
        type_name: &str,
        entity_id: &str,
        message: SendChannel<M>,
        reply_id: Option<&str>,
        reply: &ReplyChannel<R>,
    ) -> crate::Result<()> {
        let recipient = self.recipient(type_name).await?;
        let shard = (recipient.shard_of)(entity_id);

        loop {
            let Some(pod) = self.inner.table.pod_for(shard) else {
                tokio::time::sleep(UNASSIGNED_BACKOFF).await;
                continue;
            };
            let local = pod == self.inner.self_address && !self.inner.config.simulate_remote_pods;

            match self
                .send_to_pod(&recipient, type_name, entity_id, message.clone(), reply_id, reply, &pod)
                .await
            {
                Ok(()) => return Ok(()),
                // A remote peer refusing the entity means our routing is
                // stale; the local manager refusing it is final.
                Err(Error::EntityNotManagedByThisPod(_)) if !local => {
                    tracing::debug!(
                        entity_type = type_name,
                        entity_id,
                        %pod,
                        "routing is stale; backing off before retrying"
                    );
                    tokio::time::sleep(STALE_ROUTE_BACKOFF).await;
                }
                Err(Error::PodUnavailable(unavailable)) => {
                    self.report_unhealthy_pod(&unavailable).await;
                    tokio::time::sleep(STALE_ROUTE_BACKOFF).await;
                }
                Err(err) => {
                    reply.fail(err.clone());
                    return Err(err);
                }
            }
        }
    }

    /// One delivery attempt against a resolved pod.
    #[allow(clippy::too_many_arguments)]
    async fn send_to_pod<M: Wire, R: Wire>(
        &self,
        recipient: &RegisteredRecipient,
        type_name: &str,
        entity_id: &str,
        message: SendChannel<M>,
        reply_id: Option<&str>,
        reply: &ReplyChannel<R>,
        pod: &PodAddress,
    ) -> crate::Result<()> {
        if *pod == self.inner.self_address && !self.inner.config.simulate_remote_pods {
            // Local fast path: no serialization, straight into the manager.
            let manager = recipient
                .manager
                .as_any()
                .downcast_ref::<EntityManager<M>>()
                .ok_or_else(|| Error::RecipientTypeMismatch(type_name.to_string()))?;
            manager.send_channel(entity_id, message).await?;
            if reply_id.is_none() {
                reply.end();
            }
            return Ok(());
        }

        let envelope = {
            let entity_id = entity_id.to_string();
            let type_name = type_name.to_string();
            let reply_id = reply_id.map(String::from);
            move |body: Bytes| BinaryMessage {
                entity_id: entity_id.clone(),
                entity_type: type_name.clone(),
                body,
                reply_id: reply_id.clone(),
            }
        };

        match (message, reply.kind()) {
            (SendChannel::Single(m), ReplyKind::Single) => {
                let message = envelope(codec::encode(&m)?);
                match self.inner.pods.send_message(pod, message).await? {
                    Some(bytes) => reply.reply_single(codec::decode::<R>(&bytes)?),
                    None => reply.end(),
                }
                Ok(())
            }
            (SendChannel::Single(m), ReplyKind::Stream) => {
                let message = envelope(codec::encode(&m)?);
                let chunks = self
                    .open_receive_stream(self.inner.pods.send_message_and_receive_stream(pod, message))
                    .await?;
                self.spawn_reply_copy(reply.clone(), chunks);
                Ok(())
            }
            (SendChannel::Stream(factory), ReplyKind::Single) => {
                let failure = Arc::new(std::sync::Mutex::new(None));
                let messages = encode_stream(factory(), envelope, failure.clone());
                let response = self.inner.pods.send_stream(pod, messages).await?;
                if let Some(err) = failure.lock().unwrap().take() {
                    return Err(err);
                }
                match response {
                    Some(bytes) => reply.reply_single(codec::decode::<R>(&bytes)?),
                    None => reply.end(),
                }
                Ok(())
            }
            (SendChannel::Stream(factory), ReplyKind::Stream) => {
                let failure = Arc::new(std::sync::Mutex::new(None));
                let messages = encode_stream(factory(), envelope, failure.clone());
                let chunks = self
                    .open_receive_stream(self.inner.pods.send_stream_and_receive_stream(pod, messages))
                    .await?;
                self.spawn_reply_copy(reply.clone(), chunks);
                Ok(())
            }
        }
    }

    /// Open a reply stream, peeking its head so that retryable routing
    /// errors surface to the retry loop before any chunk was consumed.
    async fn open_receive_stream(
        &self,
        open: impl Future<Output = crate::Result<BoxStream<'static, crate::Result<Bytes>>>>,
    ) -> crate::Result<BoxStream<'static, crate::Result<Bytes>>> {
        let mut chunks = open.await?;
        match chunks.next().await {
            None => Ok(futures::stream::empty().boxed()),
            Some(Err(err))
                if matches!(
                    err,
                    Error::EntityNotManagedByThisPod(_) | Error::PodUnavailable(_)
                ) =>
            {
                Err(err)
            }
            Some(first) => Ok(futures::stream::once(futures::future::ready(first))
                .chain(chunks)
                .boxed()),
        }
    }

    /// Copy decoded chunks into the reply. Detached: the copy races the
    /// consumer, and exits once the output side hangs up.
    fn spawn_reply_copy<R: Wire>(
        &self,
        reply: ReplyChannel<R>,
        chunks: BoxStream<'static, crate::Result<Bytes>>,
    ) {
        tokio::spawn(async move {
            let decoded = chunks.map(|chunk| chunk.and_then(|bytes| codec::decode::<R>(&bytes)));
            reply.reply_stream(decoded.boxed()).await;
        });
    }

    /// Report a pod as unhealthy, at most once per configured interval
    /// across all senders of this pod.
    async fn report_unhealthy_pod(&self, pod: &PodAddress) {
        let interval = self.inner.config.unhealthy_pod_report_interval.as_millis() as u64;
        let now = self.inner.started_at.elapsed().as_millis() as u64;
        let last = self.inner.last_unhealthy_report.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last - 1) < interval {
            return;
        }
        if self
            .inner
            .last_unhealthy_report
            .compare_exchange(last, now + 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            // A concurrent sender won the race and reports instead.
            return;
        }
        tracing::warn!(%pod, "pod looks unavailable; notifying the shard manager");
        if let Err(err) = self.inner.shard_manager.notify_unhealthy_pod(pod.clone()).await {
            tracing::warn!(%pod, error = %err, "failed to report unhealthy pod");
        }
    }

    // ---- receive side, invoked by the transport server -------------------

    /// Unary message in, optional unary reply out.
    pub async fn handle_message(&self, message: BinaryMessage) -> crate::Result<Option<Bytes>> {
        let recipient = self.recipient(&message.entity_type).await?;
        match message.reply_id.clone() {
            None => {
                recipient
                    .manager
                    .deliver_binary_single(&message.entity_id, &message.body)
                    .await?;
                Ok(None)
            }
            Some(reply_id) => {
                let (reply, output) = ReplyChannel::<Bytes>::single();
                let output = output.with_registration(
                    self.inner
                        .replies
                        .insert(reply_id, RegisteredReply::Binary(reply.clone())),
                );
                if let Err(err) = recipient
                    .manager
                    .deliver_binary_single(&message.entity_id, &message.body)
                    .await
                {
                    reply.fail(err.clone());
                    return Err(err);
                }
                output.await_value().await
            }
        }
    }

    /// Unary message in, stream of reply chunks out.
    pub async fn handle_message_receive_stream(
        &self,
        message: BinaryMessage,
    ) -> crate::Result<BoxStream<'static, crate::Result<Bytes>>> {
        let recipient = self.recipient(&message.entity_type).await?;
        let (reply, output) = ReplyChannel::<Bytes>::stream();
        let output = match message.reply_id.clone() {
            Some(reply_id) => output.with_registration(
                self.inner
                    .replies
                    .insert(reply_id, RegisteredReply::Binary(reply.clone())),
            ),
            None => output,
        };
        if let Err(err) = recipient
            .manager
            .deliver_binary_single(&message.entity_id, &message.body)
            .await
        {
            reply.fail(err.clone());
            return Err(err);
        }
        if message.reply_id.is_none() {
            reply.end();
        }
        Ok(output.boxed())
    }

    /// Stream of messages in, optional unary reply out once drained.
    pub async fn handle_stream(
        &self,
        mut messages: BoxStream<'static, BinaryMessage>,
    ) -> crate::Result<Option<Bytes>> {
        let Some(first) = messages.next().await else {
            return Ok(None);
        };
        let recipient = self.recipient(&first.entity_type).await?;
        match first.reply_id.clone() {
            None => {
                self.drain_into(&recipient, first, messages).await?;
                Ok(None)
            }
            Some(reply_id) => {
                let (reply, output) = ReplyChannel::<Bytes>::single();
                let output = output.with_registration(
                    self.inner
                        .replies
                        .insert(reply_id, RegisteredReply::Binary(reply.clone())),
                );
                if let Err(err) = self.drain_into(&recipient, first, messages).await {
                    reply.fail(err.clone());
                    return Err(err);
                }
                output.await_value().await
            }
        }
    }

    /// Stream of messages in, stream of reply chunks out; the inbound copy
    /// runs concurrently with the reply stream.
    pub async fn handle_stream_receive_stream(
        &self,
        mut messages: BoxStream<'static, BinaryMessage>,
    ) -> crate::Result<BoxStream<'static, crate::Result<Bytes>>> {
        let Some(first) = messages.next().await else {
            return Ok(futures::stream::empty().boxed());
        };
        let recipient = self.recipient(&first.entity_type).await?;

        let (reply, output) = ReplyChannel::<Bytes>::stream();
        let has_reply = first.reply_id.is_some();
        let output = match first.reply_id.clone() {
            Some(reply_id) => output.with_registration(
                self.inner
                    .replies
                    .insert(reply_id, RegisteredReply::Binary(reply.clone())),
            ),
            None => output,
        };

        tokio::spawn({
            let sharding = self.clone();
            let reply = reply.clone();
            async move {
                if let Err(err) = sharding.drain_into(&recipient, first, messages).await {
                    reply.fail(err);
                } else if !has_reply {
                    reply.end();
                }
            }
        });
        Ok(output.boxed())
    }

    /// Enqueue each element of an inbound stream as it arrives. Per-element
    /// enqueues retry inside the manager, so a live network stream is never
    /// replayed.
    async fn drain_into(
        &self,
        recipient: &RegisteredRecipient,
        first: BinaryMessage,
        mut rest: BoxStream<'static, BinaryMessage>,
    ) -> crate::Result<()> {
        recipient
            .manager
            .deliver_binary_single(&first.entity_id, &first.body)
            .await?;
        while let Some(message) = rest.next().await {
            recipient
                .manager
                .deliver_binary_single(&message.entity_id, &message.body)
                .await?;
        }
        Ok(())
    }
}

fn encode_stream<M: Wire>(
    source: BoxStream<'static, M>,
    envelope: impl Fn(Bytes) -> BinaryMessage + Send + 'static,
    failure: Arc<std::sync::Mutex<Option<Error>>>,
) -> BoxStream<'static, BinaryMessage> {
    source
        .map(move |m| codec::encode(&m).map(|bytes| envelope(bytes)))
        .scan((), move |_, item| {
            futures::future::ready(match item {
                Ok(message) => Some(message),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode outbound stream element");
                    *failure.lock().unwrap() = Some(err);
                    None
                }
            })
        })
        .boxed()
}

/// Point-to-point sender for one entity type.
pub struct Messenger<M: Wire> {
    sharding: Sharding,
    recipient: RecipientType<M>,
    timeout: Option<Duration>,
}

impl<M: Wire> Messenger<M> {
    /// Replace the configured send timeout. `None` retries forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and wait for its reply. `Ok(None)` means the entity
    /// completed the reply without a value. On timeout the in-flight send
    /// is cancelled so routing retries stop.
    pub async fn send<R: Wire>(
        &self,
        entity_id: &str,
        make: impl FnOnce(Replier<R>) -> M,
    ) -> crate::Result<Option<R>> {
        let reply_id = uuid::Uuid::new_v4().to_string();
        let message = make(Replier::new(reply_id.clone()));
        let (reply, output) = ReplyChannel::single();
        let output = output.with_registration(self.sharding.register_reply(&reply_id, &reply));

        let send = async {
            self.sharding
                .send_typed(
                    self.recipient.name(),
                    entity_id,
                    SendChannel::Single(message),
                    Some(&reply_id),
                    &reply,
                )
                .await?;
            output.await_value().await
        };
        match self.timeout {
            None => send.await,
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => {
                    let err = self.timeout_error(entity_id);
                    reply.fail(err.clone());
                    Err(err)
                }
            },
        }
    }

    /// Fire-and-forget. The configured timeout, if any, bounds the routing
    /// retries; hitting it is not an error.
    pub async fn send_discard(&self, entity_id: &str, message: M) -> crate::Result<()> {
        let (reply, _output) = ReplyChannel::<()>::single();
        let send = self.sharding.send_typed(
            self.recipient.name(),
            entity_id,
            SendChannel::Single(message),
            None,
            &reply,
        );
        match self.timeout {
            None => send.await,
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => Ok(()),
            },
        }
    }

    /// Send one request and consume a stream of reply chunks.
    pub async fn send_and_receive_stream<R: Wire>(
        &self,
        entity_id: &str,
        make: impl FnOnce(StreamReplier<R>) -> M,
    ) -> crate::Result<StreamOutput<R>> {
        let reply_id = uuid::Uuid::new_v4().to_string();
        let message = make(StreamReplier::new(reply_id.clone()));
        let (reply, output) = ReplyChannel::stream();
        let output = output.with_registration(self.sharding.register_reply(&reply_id, &reply));

        let send = self.sharding.send_typed(
            self.recipient.name(),
            entity_id,
            SendChannel::Single(message),
            Some(&reply_id),
            &reply,
        );
        match self.timeout {
            None => send.await?,
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result?,
                Err(_) => {
                    let err = self.timeout_error(entity_id);
                    reply.fail(err.clone());
                    return Err(err);
                }
            },
        }
        Ok(output)
    }

    /// Stream requests to one entity and wait for its single reply. The
    /// factory is invoked once per routing attempt, so retries replay the
    /// stream from the start.
    pub async fn send_stream<R: Wire, S>(
        &self,
        entity_id: &str,
        make: impl Fn(Replier<R>) -> S + Send + Sync + 'static,
    ) -> crate::Result<Option<R>>
    where
        S: Stream<Item = M> + Send + 'static,
    {
        let reply_id = uuid::Uuid::new_v4().to_string();
        let (reply, output) = ReplyChannel::single();
        let output = output.with_registration(self.sharding.register_reply(&reply_id, &reply));

        let message = {
            let reply_id = reply_id.clone();
            SendChannel::Stream(Arc::new(move || make(Replier::new(reply_id.clone())).boxed()))
        };
        let send = async {
            self.sharding
                .send_typed(self.recipient.name(), entity_id, message, Some(&reply_id), &reply)
                .await?;
            output.await_value().await
        };
        match self.timeout {
            None => send.await,
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => {
                    let err = self.timeout_error(entity_id);
                    reply.fail(err.clone());
                    Err(err)
                }
            },
        }
    }

    /// Fire-and-forget a stream of requests.
    pub async fn send_stream_discard<S>(
        &self,
        entity_id: &str,
        messages: impl Fn() -> S + Send + Sync + 'static,
    ) -> crate::Result<()>
    where
        S: Stream<Item = M> + Send + 'static,
    {
        let (reply, _output) = ReplyChannel::<()>::single();
        let send = self.sharding.send_typed(
            self.recipient.name(),
            entity_id,
            SendChannel::stream(messages),
            None,
            &reply,
        );
        match self.timeout {
            None => send.await,
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => Ok(()),
            },
        }
    }

    /// Stream requests while consuming streamed reply chunks.
    pub async fn send_stream_and_receive_stream<R: Wire, S>(
        &self,
        entity_id: &str,
        make: impl Fn(StreamReplier<R>) -> S + Send + Sync + 'static,
    ) -> crate::Result<StreamOutput<R>>
    where
        S: Stream<Item = M> + Send + 'static,
    {
        let reply_id = uuid::Uuid::new_v4().to_string();
        let (reply, output) = ReplyChannel::stream();
        let output = output.with_registration(self.sharding.register_reply(&reply_id, &reply));

        let message = {
            let reply_id = reply_id.clone();
            SendChannel::Stream(Arc::new(move || {
                make(StreamReplier::new(reply_id.clone())).boxed()
            }))
        };
        let send = self.sharding.send_typed(
            self.recipient.name(),
            entity_id,
            message,
            Some(&reply_id),
            &reply,
        );
        match self.timeout {
            None => send.await?,
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result?,
                Err(_) => {
                    let err = self.timeout_error(entity_id);
                    reply.fail(err.clone());
                    return Err(err);
                }
            },
        }
        Ok(output)
    }

    fn timeout_error(&self, entity_id: &str) -> Error {
        Error::SendTimeout {
            entity_type: self.recipient.name().to_string(),
            entity_id: entity_id.to_string(),
        }
    }
}

/// One-to-all-pods sender for a topic type.
pub struct Broadcaster<M: Wire> {
    sharding: Sharding,
    recipient: RecipientType<M>,
    timeout: Option<Duration>,
}

impl<M: Wire> Broadcaster<M> {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fan a request out to every pod currently holding shards, collecting
    /// per-pod results. `Ok(None)` marks a pod that acknowledged without a
    /// value; failures and timeouts are per-pod errors. Broadcasting with
    /// zero pods resolves to an empty map.
    pub async fn broadcast<R: Wire>(
        &self,
        topic: &str,
        make: impl Fn(Replier<R>) -> M,
    ) -> HashMap<PodAddress, crate::Result<Option<R>>> {
        let sends = self.sharding.inner.table.pods().into_iter().map(|pod| {
            let reply_id = uuid::Uuid::new_v4().to_string();
            let message = make(Replier::new(reply_id.clone()));
            async move {
                let result = self
                    .send_one(&pod, topic, message, Some(reply_id))
                    .await;
                (pod, result)
            }
        });
        futures::future::join_all(sends).await.into_iter().collect()
    }

    /// Fan a request out to every pod, ignoring results.
    pub async fn broadcast_discard(&self, topic: &str, message: M) {
        let sends = self.sharding.inner.table.pods().into_iter().map(|pod| {
            let message = message.clone();
            async move {
                if let Err(err) = self.send_one::<()>(&pod, topic, message, None).await {
                    tracing::debug!(%pod, topic, error = %err, "broadcast delivery failed");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Deliver to one explicit pod; broadcasts do not retry routing.
    async fn send_one<R: Wire>(
        &self,
        pod: &PodAddress,
        topic: &str,
        message: M,
        reply_id: Option<String>,
    ) -> crate::Result<Option<R>> {
        let recipient = self.sharding.recipient(self.recipient.name()).await?;
        let (reply, output) = ReplyChannel::single();
        let output = match &reply_id {
            Some(reply_id) => {
                output.with_registration(self.sharding.register_reply(reply_id, &reply))
            }
            None => output,
        };

        let attempt = async {
            self.sharding
                .send_to_pod(
                    &recipient,
                    self.recipient.name(),
                    topic,
                    SendChannel::Single(message),
                    reply_id.as_deref(),
                    &reply,
                    pod,
                )
                .await?;
            output.await_value().await
        };
        let result = match self.timeout {
            None => attempt.await,
            Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(self.broadcast_timeout_error(topic)),
            },
        };
        if let Err(err) = &result {
            reply.fail(err.clone());
        }
        result
    }

    fn broadcast_timeout_error(&self, topic: &str) -> Error {
        Error::SendTimeout {
            entity_type: self.recipient.name().to_string(),
            entity_id: topic.to_string(),
        }
    }
}
