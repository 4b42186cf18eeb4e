//! Seams to the external collaborators: the shard manager service, the
//! store publishing assignment changes, and the pod-to-pod transport. The
//! runtime consumes these through object-safe traits; deployments provide
//! the gRPC (or in-process) implementations.

use crate::types::{BinaryMessage, PodAddress, ShardId};
use crate::Error;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tonic::Code;

/// Client of the central shard manager.
#[async_trait::async_trait]
pub trait ShardManagerClient: Send + Sync + 'static {
    async fn register(&self, pod: PodAddress) -> crate::Result<()>;
    async fn unregister(&self, pod: PodAddress) -> crate::Result<()>;
    async fn get_assignments(&self) -> crate::Result<HashMap<ShardId, Option<PodAddress>>>;
    async fn notify_unhealthy_pod(&self, pod: PodAddress) -> crate::Result<()>;
}

/// The store through which the shard manager publishes assignment changes.
pub trait AssignmentStorage: Send + Sync + 'static {
    /// A fresh, lazily-evaluated stream of full assignment snapshots. The
    /// refresher subscribes anew after every pipeline restart.
    fn assignments_stream(
        &self,
    ) -> BoxStream<'static, crate::Result<HashMap<ShardId, Option<PodAddress>>>>;
}

/// Pod-to-pod transport. One method per request/response arity; the reply
/// to a message always flows back on the call that carried it.
///
/// Implementations translate their status codes through
/// [`unary_status_error`] / [`stream_status_error`] so the router can tell
/// stale routing and dead pods apart from genuine failures.
#[async_trait::async_trait]
pub trait Pods: Send + Sync + 'static {
    async fn assign_shards(
        &self,
        pod: &PodAddress,
        shards: BTreeSet<ShardId>,
    ) -> crate::Result<()>;

    async fn unassign_shards(
        &self,
        pod: &PodAddress,
        shards: BTreeSet<ShardId>,
    ) -> crate::Result<()>;

    async fn ping(&self, pod: &PodAddress) -> crate::Result<()>;

    async fn send_message(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> crate::Result<Option<Bytes>>;

    async fn send_stream(
        &self,
        pod: &PodAddress,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> crate::Result<Option<Bytes>>;

    async fn send_message_and_receive_stream(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> crate::Result<BoxStream<'static, crate::Result<Bytes>>>;

    async fn send_stream_and_receive_stream(
        &self,
        pod: &PodAddress,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> crate::Result<BoxStream<'static, crate::Result<Bytes>>>;
}

/// Translate a unary RPC failure into the router's retry taxonomy.
pub fn unary_status_error(entity_id: &str, pod: &PodAddress, status: tonic::Status) -> Error {
    match status.code() {
        Code::ResourceExhausted => Error::EntityNotManagedByThisPod(entity_id.to_string()),
        Code::Unavailable | Code::Cancelled => Error::PodUnavailable(pod.clone()),
        _ => status.into(),
    }
}

/// Translate a streaming RPC failure. Unlike the unary case, `cancelled`
/// means the peer closed the stream, not that the pod is down.
pub fn stream_status_error(entity_id: &str, pod: &PodAddress, status: tonic::Status) -> Error {
    match status.code() {
        Code::ResourceExhausted => Error::EntityNotManagedByThisPod(entity_id.to_string()),
        Code::Unavailable => Error::PodUnavailable(pod.clone()),
        Code::Cancelled => Error::StreamCancelled,
        _ => status.into(),
    }
}

// A connection which may be ready (Some), currently being dialed (locked),
// or neither. Ready connections track uses since the last sweep.
type PoolState<C> = Arc<futures::lock::Mutex<Option<(C, usize)>>>;

type Dial<C> = Box<dyn Fn(PodAddress) -> BoxFuture<'static, crate::Result<C>> + Send + Sync>;

/// Pools ready transport connections to peer pods, dialing on demand
/// through a delegated closure. As assignments move, pods come and go;
/// call [`ConnectionPool::sweep`] periodically to drop connections unused
/// since the preceding sweep.
pub struct ConnectionPool<C: Clone> {
    dial: Dial<C>,
    states: Mutex<HashMap<PodAddress, PoolState<C>>>,
}

impl<C: Clone> ConnectionPool<C> {
    pub fn new<F>(dial: impl Fn(PodAddress) -> F + Send + Sync + 'static) -> Self
    where
        F: std::future::Future<Output = crate::Result<C>> + Send + 'static,
    {
        Self {
            dial: Box::new(move |pod| dial(pod).boxed()),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// A ready connection to `pod`, dialing one if needed. Concurrent
    /// callers of the same pod share a single dial attempt.
    pub async fn get(&self, pod: &PodAddress) -> crate::Result<C> {
        // Non-async lock, never held across an await point.
        let state = self
            .states
            .lock()
            .unwrap()
            .entry(pod.clone())
            .or_default()
            .clone();

        let mut state = state.lock().await;

        // Fast path: already dialed and ready.
        if let Some((conn, uses)) = &mut *state {
            *uses += 1;
            return Ok(conn.clone());
        }

        let conn = (self.dial)(pod.clone()).await?;
        *state = Some((conn.clone(), 1));
        Ok(conn)
    }

    /// Drop the pooled connection of a pod observed failing, forcing the
    /// next `get` to re-dial.
    pub fn invalidate(&self, pod: &PodAddress) {
        self.states.lock().unwrap().remove(pod);
    }

    /// Close connections which have not been used since the previous sweep.
    pub fn sweep(&self) {
        let mut states = self.states.lock().unwrap();
        states.retain(|pod, state| {
            // Keep entries another task is currently dialing.
            let Some(mut state) = state.try_lock() else {
                return true;
            };
            // Drop entries which never finished dialing.
            let Some((_conn, uses)) = &mut *state else {
                return false;
            };
            if *uses == 0 {
                tracing::debug!(%pod, "dropping idle pod connection");
                return false;
            }
            *uses = 0; // Mark for the next sweep.
            true
        });
    }
}
