//! End-to-end tests against an in-process cluster: real routers and entity
//! managers wired together through loopback implementations of the shard
//! manager, assignment storage and pod transport.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use hive::transport::{AssignmentStorage, Pods, ShardManagerClient};
use hive::types::default_shard;
use hive::{
    BinaryMessage, Config, EntityOptions, Error, Mailbox, PodAddress, RecipientType, Replier,
    ShardId, Sharding, StreamReplier, TerminationAck,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

const SHARDS: u32 = 8;

// ---- loopback collaborators ---------------------------------------------

#[derive(Default)]
struct TestShardManager {
    assignments: Mutex<HashMap<ShardId, Option<PodAddress>>>,
    registrations: AtomicU64,
    unhealthy_reports: Mutex<Vec<PodAddress>>,
}

impl TestShardManager {
    fn assign_all(&self, pod: &PodAddress) {
        let mut assignments = self.assignments.lock().unwrap();
        for shard in 1..=SHARDS {
            assignments.insert(shard, Some(pod.clone()));
        }
    }

    fn set(&self, shard: ShardId, pod: Option<PodAddress>) {
        self.assignments.lock().unwrap().insert(shard, pod);
    }
}

#[async_trait::async_trait]
impl ShardManagerClient for TestShardManager {
    async fn register(&self, _pod: PodAddress) -> hive::Result<()> {
        self.registrations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn unregister(&self, _pod: PodAddress) -> hive::Result<()> {
        Ok(())
    }

    async fn get_assignments(&self) -> hive::Result<HashMap<ShardId, Option<PodAddress>>> {
        Ok(self.assignments.lock().unwrap().clone())
    }

    async fn notify_unhealthy_pod(&self, pod: PodAddress) -> hive::Result<()> {
        self.unhealthy_reports.lock().unwrap().push(pod);
        Ok(())
    }
}

#[derive(Default)]
struct TestStorage {
    subscribers: Mutex<Vec<tokio::sync::mpsc::UnboundedSender<HashMap<ShardId, Option<PodAddress>>>>>,
}

impl TestStorage {
    fn publish(&self, event: HashMap<ShardId, Option<PodAddress>>) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl AssignmentStorage for TestStorage {
    fn assignments_stream(
        &self,
    ) -> BoxStream<'static, hive::Result<HashMap<ShardId, Option<PodAddress>>>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        UnboundedReceiverStream::new(rx).map(Ok).boxed()
    }
}

/// Routes transport calls straight into the target pod's handlers.
#[derive(Default)]
struct ClusterPods {
    pods: Mutex<HashMap<PodAddress, Sharding>>,
    unary_calls: AtomicU64,
}

impl ClusterPods {
    fn join(&self, sharding: &Sharding) {
        self.pods
            .lock()
            .unwrap()
            .insert(sharding.self_address().clone(), sharding.clone());
    }

    fn target(&self, pod: &PodAddress) -> hive::Result<Sharding> {
        self.pods
            .lock()
            .unwrap()
            .get(pod)
            .cloned()
            .ok_or_else(|| Error::PodUnavailable(pod.clone()))
    }
}

#[async_trait::async_trait]
impl Pods for ClusterPods {
    async fn assign_shards(&self, pod: &PodAddress, shards: BTreeSet<ShardId>) -> hive::Result<()> {
        self.target(pod)?.assign_shards(shards).await;
        Ok(())
    }

    async fn unassign_shards(
        &self,
        pod: &PodAddress,
        shards: BTreeSet<ShardId>,
    ) -> hive::Result<()> {
        self.target(pod)?.unassign_shards(shards).await;
        Ok(())
    }

    async fn ping(&self, pod: &PodAddress) -> hive::Result<()> {
        self.target(pod).map(|_| ())
    }

    async fn send_message(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> hive::Result<Option<Bytes>> {
        self.unary_calls.fetch_add(1, Ordering::Relaxed);
        self.target(pod)?.handle_message(message).await
    }

    async fn send_stream(
        &self,
        pod: &PodAddress,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> hive::Result<Option<Bytes>> {
        self.target(pod)?.handle_stream(messages).await
    }

    async fn send_message_and_receive_stream(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> hive::Result<BoxStream<'static, hive::Result<Bytes>>> {
        self.target(pod)?.handle_message_receive_stream(message).await
    }

    async fn send_stream_and_receive_stream(
        &self,
        pod: &PodAddress,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> hive::Result<BoxStream<'static, hive::Result<Bytes>>> {
        self.target(pod)?.handle_stream_receive_stream(messages).await
    }
}

// ---- a counter entity ----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CounterMsg {
    Increment { amount: u64, replier: Replier<u64> },
    Note(u64),
    Subscribe { chunks: u64, replier: StreamReplier<u64> },
    Stop(TerminationAck),
}

fn counter_type() -> RecipientType<CounterMsg> {
    RecipientType::entity("counter")
}

fn counter_behavior(
    sharding: Sharding,
    starts: Arc<AtomicU64>,
) -> impl Fn(String, Mailbox<CounterMsg>) -> BoxFuture<'static, ()> + Send + Sync + 'static {
    move |_entity_id, mut mailbox| {
        starts.fetch_add(1, Ordering::Relaxed);
        let sharding = sharding.clone();
        async move {
            let mut total = 0u64;
            while let Some(message) = mailbox.recv().await {
                match message {
                    CounterMsg::Increment { amount, replier } => {
                        total += amount;
                        let _ = replier.reply(&sharding, total).await;
                    }
                    CounterMsg::Note(amount) => total += amount,
                    CounterMsg::Subscribe { chunks, replier } => {
                        let _ = replier
                            .reply_stream(&sharding, futures::stream::iter((0..chunks).map(Ok)))
                            .await;
                    }
                    CounterMsg::Stop(ack) => {
                        ack.done();
                        return;
                    }
                }
            }
        }
        .boxed()
    }
}

struct Cluster {
    manager: Arc<TestShardManager>,
    storage: Arc<TestStorage>,
    pods: Arc<ClusterPods>,
}

impl Cluster {
    fn new() -> Self {
        // Set RUST_LOG to see the runtime's tracing while debugging a test.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        Self {
            manager: Arc::new(TestShardManager::default()),
            storage: Arc::new(TestStorage::default()),
            pods: Arc::new(ClusterPods::default()),
        }
    }

    /// A pod with the counter entity registered. Does not yet register with
    /// the shard manager.
    async fn pod(
        &self,
        port: u16,
        configure: impl FnOnce(&mut Config),
    ) -> (Sharding, Arc<AtomicU64>) {
        let mut config = Config {
            number_of_shards: SHARDS,
            self_host: "pod".to_string(),
            sharding_port: port,
            ..Config::default()
        };
        configure(&mut config);

        let sharding = Sharding::new(
            config,
            self.manager.clone(),
            self.storage.clone(),
            self.pods.clone(),
        );
        self.pods.join(&sharding);

        let starts = Arc::new(AtomicU64::new(0));
        sharding
            .register_entity(
                counter_type(),
                counter_behavior(sharding.clone(), starts.clone()),
                EntityOptions::default(),
            )
            .await;
        (sharding, starts)
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---- scenarios -----------------------------------------------------------

#[tokio::test]
async fn local_single_send_round_trips() {
    let cluster = Cluster::new();
    let (pod, _starts) = cluster.pod(1, |_| {}).await;
    cluster.manager.assign_all(pod.self_address());
    pod.register().await.unwrap();

    let messenger = pod.messenger(counter_type());
    let first = messenger
        .send("user:42", |replier| CounterMsg::Increment { amount: 3, replier })
        .await
        .unwrap();
    assert_eq!(first, Some(3));

    // State accumulated in the same entity.
    let second = messenger
        .send("user:42", |replier| CounterMsg::Increment { amount: 4, replier })
        .await
        .unwrap();
    assert_eq!(second, Some(7));

    // No transport round trip for a self-owned shard.
    assert_eq!(cluster.pods.unary_calls.load(Ordering::Relaxed), 0);

    // The reply registry drains as channels complete.
    wait_until("reply registry to drain", || pod.pending_replies() == 0).await;
}

#[tokio::test]
async fn register_is_idempotent() {
    let cluster = Cluster::new();
    let (pod, _starts) = cluster.pod(1, |_| {}).await;
    cluster.manager.assign_all(pod.self_address());

    pod.register().await.unwrap();
    pod.register().await.unwrap();

    assert_eq!(cluster.manager.registrations.load(Ordering::Relaxed), 1);
    // Exactly one refresher is running: a leaked second one would open its
    // own change-stream subscription.
    wait_until("the refresher to subscribe", || {
        !cluster.storage.subscribers.lock().unwrap().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cluster.storage.subscribers.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn remote_send_reaches_the_owning_pod() {
    let cluster = Cluster::new();
    let (pod1, starts1) = cluster.pod(1, |_| {}).await;
    let (pod2, starts2) = cluster.pod(2, |_| {}).await;
    cluster.manager.assign_all(pod2.self_address());
    pod1.register().await.unwrap();
    pod2.register().await.unwrap();

    let got = pod1
        .messenger(counter_type())
        .send("user:42", |replier| CounterMsg::Increment { amount: 9, replier })
        .await
        .unwrap();

    assert_eq!(got, Some(9));
    assert_eq!(starts1.load(Ordering::Relaxed), 0);
    assert_eq!(starts2.load(Ordering::Relaxed), 1);
    assert_eq!(cluster.pods.unary_calls.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_routing_retries_and_lands_locally() {
    let cluster = Cluster::new();
    let (pod1, starts1) = cluster.pod(1, |_| {}).await;
    let (pod2, _starts2) = cluster.pod(2, |_| {}).await;

    let shard = default_shard("user:42", SHARDS);
    cluster.manager.set(shard, Some(pod2.self_address().clone()));
    pod1.register().await.unwrap();
    pod2.register().await.unwrap();

    // The shard manager has already moved the shard off pod 2, but pod 1's
    // table doesn't know yet.
    pod2.unassign_shards(BTreeSet::from([shard])).await;

    let send = tokio::spawn({
        let pod1 = pod1.clone();
        async move {
            pod1.messenger(counter_type())
                .send("user:42", |replier| CounterMsg::Increment { amount: 5, replier })
                .await
        }
    });

    // First attempt fails remotely with stale routing; while the router
    // backs off, the shard manager assigns the shard here.
    tokio::time::sleep(Duration::from_millis(50)).await;
    pod1.assign_shards(BTreeSet::from([shard])).await;

    assert_eq!(send.await.unwrap().unwrap(), Some(5));
    // One remote attempt (the failed one); the retry was delivered locally.
    assert_eq!(cluster.pods.unary_calls.load(Ordering::Relaxed), 1);
    assert_eq!(starts1.load(Ordering::Relaxed), 1);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_pod_reports_are_debounced() {
    let cluster = Cluster::new();
    let (pod1, _starts) = cluster
        .pod(1, |config| {
            config.unhealthy_pod_report_interval = Duration::from_secs(30);
            config.send_timeout = Some(Duration::from_secs(1));
        })
        .await;
    // Every shard points at a pod which never joined the transport.
    let ghost = PodAddress::new("ghost", 9);
    cluster.manager.assign_all(&ghost);
    pod1.register().await.unwrap();

    let messenger = Arc::new(pod1.messenger(counter_type()));
    let sends = (0..3).map(|n| {
        let messenger = messenger.clone();
        async move {
            messenger
                .send_discard(&format!("user:{n}"), CounterMsg::Note(n))
                .await
        }
    });
    for result in futures::future::join_all(sends).await {
        // Timed-out discards are not errors.
        result.unwrap();
    }

    let reports = cluster.manager.unhealthy_reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0], ghost);
}

#[tokio::test(start_paused = true)]
async fn sends_wait_for_an_assignment_until_the_caller_times_out() {
    let cluster = Cluster::new();
    let (pod1, _starts) = cluster
        .pod(1, |config| config.send_timeout = Some(Duration::from_millis(300)))
        .await;
    // No assignments at all.
    pod1.register().await.unwrap();

    let err = pod1
        .messenger(counter_type())
        .send("user:42", |replier| CounterMsg::Increment { amount: 1, replier })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SendTimeout { .. }));
    wait_until("reply registry to drain", || pod1.pending_replies() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn idle_entities_expire_and_restart() {
    let cluster = Cluster::new();
    let (pod, starts) = cluster
        .pod(1, |config| config.entity_max_idle_time = Duration::from_secs(1))
        .await;
    cluster.manager.assign_all(pod.self_address());
    pod.register().await.unwrap();

    let messenger = pod.messenger(counter_type());
    messenger.send_discard("user:42", CounterMsg::Note(1)).await.unwrap();
    assert_eq!(starts.load(Ordering::Relaxed), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The expired entity restarts from scratch: its total is gone.
    let got = messenger
        .send("user:42", |replier| CounterMsg::Increment { amount: 1, replier })
        .await
        .unwrap();
    assert_eq!(got, Some(1));
    assert_eq!(starts.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn unregister_drains_within_the_termination_timeout() {
    let cluster = Cluster::new();
    let held_acks = Arc::new(Mutex::new(Vec::new()));

    let config = Config {
        number_of_shards: SHARDS,
        self_host: "pod".to_string(),
        sharding_port: 1,
        entity_termination_timeout: Duration::from_millis(500),
        ..Config::default()
    };

    let pod = Sharding::new(
        config,
        cluster.manager.clone(),
        cluster.storage.clone(),
        cluster.pods.clone(),
    );
    cluster.pods.join(&pod);

    // Entities park their Stop acks forever, so the drain must give up.
    pod.register_entity(
        counter_type(),
        {
            let held_acks = held_acks.clone();
            move |_id, mut mailbox: Mailbox<CounterMsg>| {
                let held_acks = held_acks.clone();
                async move {
                    while let Some(message) = mailbox.recv().await {
                        if let CounterMsg::Stop(ack) = message {
                            held_acks.lock().unwrap().push(ack);
                        }
                    }
                }
                .boxed()
            }
        },
        EntityOptions::default().with_terminate_message(CounterMsg::Stop),
    )
    .await;

    cluster.manager.assign_all(pod.self_address());
    pod.register().await.unwrap();

    let messenger = pod.messenger(counter_type());
    for n in 0..10 {
        messenger
            .send_discard(&format!("user:{n}"), CounterMsg::Note(n))
            .await
            .unwrap();
    }

    let before = tokio::time::Instant::now();
    pod.unregister().await.unwrap();
    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(2));

    // Draining pods refuse new entities.
    let err = messenger
        .send_discard("user:new", CounterMsg::Note(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EntityNotManagedByThisPod(_)));
}

#[tokio::test(start_paused = true)]
async fn singleton_follows_the_sentinel_shard() {
    let cluster = Cluster::new();
    let (pod1, _s1) = cluster.pod(1, |_| {}).await;
    let (pod2, _s2) = cluster.pod(2, |_| {}).await;

    // Running-counts observed through start and drop of the task body.
    let running = [Arc::new(AtomicI64::new(0)), Arc::new(AtomicI64::new(0))];
    for (pod, running) in [(&pod1, &running[0]), (&pod2, &running[1])] {
        let running = running.clone();
        pod.register_singleton("poller", move || {
            let running = running.clone();
            async move {
                running.fetch_add(1, Ordering::Relaxed);
                let _guard = DecrementOnDrop(running);
                futures::future::pending::<()>().await
            }
            .boxed()
        })
        .await;
    }

    cluster.manager.set(1, Some(pod1.self_address().clone()));
    pod1.register().await.unwrap();
    pod2.register().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(running[0].load(Ordering::Relaxed), 1);
    assert_eq!(running[1].load(Ordering::Relaxed), 0);

    // The sentinel shard moves: the old leader stops before the new one
    // starts, per each pod's local reconcile.
    pod1.unassign_shards(BTreeSet::from([1])).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(running[0].load(Ordering::Relaxed), 0);

    pod2.assign_shards(BTreeSet::from([1])).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(running[1].load(Ordering::Relaxed), 1);
}

struct DecrementOnDrop(Arc<AtomicI64>);

impl Drop for DecrementOnDrop {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[tokio::test]
async fn broadcast_collects_a_result_per_pod() {
    let cluster = Cluster::new();
    let topic = RecipientType::<CounterMsg>::topic("events");

    let (pod1, _s1) = cluster.pod(1, |_| {}).await;
    let (pod2, _s2) = cluster.pod(2, |_| {}).await;
    for pod in [&pod1, &pod2] {
        pod.register_topic(
            topic.clone(),
            counter_behavior(pod.clone(), Arc::new(AtomicU64::new(0))),
            EntityOptions::default(),
        )
        .await;
    }

    // Half the shards on each pod.
    for shard in 1..=SHARDS {
        let owner = if shard % 2 == 0 { &pod1 } else { &pod2 };
        cluster.manager.set(shard, Some(owner.self_address().clone()));
    }
    pod1.register().await.unwrap();
    pod2.register().await.unwrap();

    let results = pod1
        .broadcaster(topic.clone())
        .broadcast("events", |replier| CounterMsg::Increment { amount: 2, replier })
        .await;

    assert_eq!(results.len(), 2);
    for (pod, result) in results {
        assert_eq!(result.unwrap(), Some(2), "unexpected reply from {pod}");
    }
}

#[tokio::test]
async fn broadcast_with_zero_pods_is_empty_and_ok() {
    let cluster = Cluster::new();
    let topic = RecipientType::<CounterMsg>::topic("events");
    let (pod1, _s1) = cluster.pod(1, |_| {}).await;
    pod1.register_topic(
        topic.clone(),
        counter_behavior(pod1.clone(), Arc::new(AtomicU64::new(0))),
        EntityOptions::default(),
    )
    .await;
    pod1.register().await.unwrap();

    let results = pod1
        .broadcaster(topic.clone())
        .broadcast::<u64>("events", |replier| CounterMsg::Increment { amount: 1, replier })
        .await;
    assert!(results.is_empty());

    pod1.broadcaster(topic).broadcast_discard("events", CounterMsg::Note(1)).await;
}

#[tokio::test]
async fn simulated_remote_pods_exercise_the_full_wire_loop() {
    let cluster = Cluster::new();
    let (pod, _starts) = cluster.pod(1, |config| config.simulate_remote_pods = true).await;
    cluster.manager.assign_all(pod.self_address());
    pod.register().await.unwrap();

    let messenger = pod.messenger(counter_type());

    // Unary request, unary reply.
    let got = messenger
        .send("user:42", |replier| CounterMsg::Increment { amount: 3, replier })
        .await
        .unwrap();
    assert_eq!(got, Some(3));
    assert_eq!(cluster.pods.unary_calls.load(Ordering::Relaxed), 1);

    // Unary request, streamed reply.
    let chunks: Vec<u64> = messenger
        .send_and_receive_stream("user:42", |replier| CounterMsg::Subscribe { chunks: 4, replier })
        .await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks, vec![0, 1, 2, 3]);

    // Streamed request, unary reply: the tail message carries the replier.
    let got = messenger
        .send_stream("user:42", |replier| {
            futures::stream::iter(vec![
                CounterMsg::Note(1),
                CounterMsg::Note(2),
                CounterMsg::Increment { amount: 0, replier },
            ])
        })
        .await
        .unwrap();
    assert_eq!(got, Some(6));

    // Streamed request, streamed reply.
    let chunks: Vec<u64> = messenger
        .send_stream_and_receive_stream("user:42", |replier| {
            futures::stream::iter(vec![CounterMsg::Subscribe { chunks: 2, replier }])
        })
        .await
        .unwrap()
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks, vec![0, 1]);
}

#[tokio::test]
async fn unknown_recipient_types_fail_fast() {
    let cluster = Cluster::new();
    let (pod, _starts) = cluster.pod(1, |_| {}).await;
    cluster.manager.assign_all(pod.self_address());
    pod.register().await.unwrap();

    let err = pod
        .messenger(RecipientType::<CounterMsg>::entity("nope"))
        .send_discard("user:42", CounterMsg::Note(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRecipientType(_)));
}

#[tokio::test]
async fn change_stream_updates_peers_but_never_self_entries() {
    let cluster = Cluster::new();
    let (pod1, _s1) = cluster.pod(1, |_| {}).await;
    let (pod2, _s2) = cluster.pod(2, |_| {}).await;

    cluster.manager.set(3, Some(pod1.self_address().clone()));
    pod1.register().await.unwrap();
    pod2.register().await.unwrap();
    // Readiness precedes the subscription; wait for both refreshers to be
    // listening before publishing.
    wait_until("refreshers to subscribe", || {
        cluster.storage.subscribers.lock().unwrap().len() == 2
    })
    .await;

    // A lagging change-stream snapshot claims shard 3 moved to pod 2 and
    // shard 4 appeared on pod 2.
    cluster.storage.publish(HashMap::from([
        (3, Some(pod2.self_address().clone())),
        (4, Some(pod2.self_address().clone())),
    ]));

    wait_until("shard 4 to appear", || {
        pod1.assignments().get(&4) == Some(pod2.self_address())
    })
    .await;
    // Shard 3 stays owned by pod 1: the change stream has no authority
    // over local ownership.
    assert_eq!(pod1.assignments().get(&3), Some(pod1.self_address()));
}
