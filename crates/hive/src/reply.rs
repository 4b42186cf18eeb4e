//! Send and reply channels.
//!
//! A send carries the outbound payload (one value, or a replayable stream of
//! them); a reply channel carries the result back, decoupling the caller's
//! expected arity from however the transport delivered it. Both ends of a
//! request hold the same vocabulary: `reply_single` on a stream channel
//! emits one chunk then ends, `reply_stream` on a single channel takes the
//! first element and drops the rest.

use crate::codec::Wire;
use crate::router::Sharding;
use crate::Error;
use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// The outbound half of a request: one value, or a stream of them.
///
/// Stream sends carry a factory rather than a live stream so that routing
/// retries can regenerate the input from the start instead of resuming a
/// half-consumed stream.
pub enum SendChannel<M> {
    Single(M),
    Stream(Arc<dyn Fn() -> BoxStream<'static, M> + Send + Sync>),
}

impl<M: Clone> Clone for SendChannel<M> {
    fn clone(&self) -> Self {
        match self {
            Self::Single(m) => Self::Single(m.clone()),
            Self::Stream(f) => Self::Stream(f.clone()),
        }
    }
}

impl<M> SendChannel<M> {
    pub fn single(message: M) -> Self {
        Self::Single(message)
    }

    pub fn stream<S>(factory: impl Fn() -> S + Send + Sync + 'static) -> Self
    where
        S: Stream<Item = M> + Send + 'static,
    {
        Self::Stream(Arc::new(move || factory().boxed()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Single,
    Stream,
}

enum Sink<R> {
    Single(oneshot::Sender<crate::Result<Option<R>>>),
    Stream(mpsc::UnboundedSender<crate::Result<R>>),
}

struct Inner<R> {
    // Taken on the first terminal transition; later signals are no-ops.
    sink: Mutex<Option<(Sink<R>, oneshot::Sender<()>)>>,
    done: Shared<BoxFuture<'static, ()>>,
    kind: ReplyKind,
}

/// Producer handle of a reply. Cloneable; the first terminal transition
/// (`reply_single`, `end`, `fail`, or a finished `reply_stream`) wins and
/// every later signal is ignored.
pub struct ReplyChannel<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for ReplyChannel<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> ReplyChannel<R> {
    /// A single-reply channel and its consumer side.
    pub fn single() -> (Self, SingleOutput<R>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::new(Sink::Single(tx), ReplyKind::Single),
            SingleOutput {
                rx,
                _registration: None,
            },
        )
    }

    /// A streaming-reply channel and its consumer side.
    pub fn stream() -> (Self, StreamOutput<R>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::new(Sink::Stream(tx), ReplyKind::Stream),
            StreamOutput {
                rx,
                _registration: None,
            },
        )
    }

    fn new(sink: Sink<R>, kind: ReplyKind) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(Some((sink, done_tx))),
                done: done_rx.map(|_| ()).boxed().shared(),
                kind,
            }),
        }
    }

    pub fn kind(&self) -> ReplyKind {
        self.inner.kind
    }

    /// Resolves once the channel reaches any terminal state, including the
    /// producer side being dropped without ever replying.
    pub fn done(&self) -> Shared<BoxFuture<'static, ()>> {
        self.inner.done.clone()
    }

    fn take_sink(&self) -> Option<(Sink<R>, oneshot::Sender<()>)> {
        self.inner.sink.lock().unwrap().take()
    }

    /// Complete with one value. On a stream channel this emits `[value]`
    /// and ends.
    pub fn reply_single(&self, value: R) {
        let Some((sink, done_tx)) = self.take_sink() else {
            return;
        };
        match sink {
            Sink::Single(tx) => {
                let _ = tx.send(Ok(Some(value)));
            }
            Sink::Stream(tx) => {
                let _ = tx.send(Ok(value));
            }
        }
        let _ = done_tx.send(());
    }

    /// Complete without a value.
    pub fn end(&self) {
        let Some((sink, done_tx)) = self.take_sink() else {
            return;
        };
        if let Sink::Single(tx) = sink {
            let _ = tx.send(Ok(None));
        }
        let _ = done_tx.send(());
    }

    /// Complete with a failure.
    pub fn fail(&self, error: Error) {
        let Some((sink, done_tx)) = self.take_sink() else {
            return;
        };
        match sink {
            Sink::Single(tx) => {
                let _ = tx.send(Err(error));
            }
            Sink::Stream(tx) => {
                let _ = tx.send(Err(error));
            }
        }
        let _ = done_tx.send(());
    }

    /// Complete from a stream of chunks.
    ///
    /// On a single channel, takes the first element (`Some`/`None`) and drops
    /// the remainder, so cancellation propagates to the source. On a stream
    /// channel, copies chunks until the source ends or fails, or until the
    /// consumer hangs up.
    pub async fn reply_stream(&self, mut source: BoxStream<'_, crate::Result<R>>) {
        let Some((sink, done_tx)) = self.take_sink() else {
            return;
        };
        match sink {
            Sink::Single(tx) => {
                let result = match source.next().await {
                    None => Ok(None),
                    Some(Ok(first)) => Ok(Some(first)),
                    Some(Err(err)) => Err(err),
                };
                let _ = tx.send(result);
            }
            Sink::Stream(tx) => {
                while let Some(item) = source.next().await {
                    let is_err = item.is_err();
                    if tx.send(item).is_err() || is_err {
                        break;
                    }
                }
            }
        }
        let _ = done_tx.send(());
    }
}

/// Consumer side of a single reply.
pub struct SingleOutput<R> {
    rx: oneshot::Receiver<crate::Result<Option<R>>>,
    // Held for its Drop: releases the reply-registry entry.
    _registration: Option<ReplyRegistration>,
}

impl<R> SingleOutput<R> {
    pub(crate) fn with_registration(mut self, registration: ReplyRegistration) -> Self {
        self._registration = Some(registration);
        self
    }

    /// Waits for the terminal transition: `Ok(Some(_))` on a value,
    /// `Ok(None)` on a no-value completion.
    pub async fn await_value(self) -> crate::Result<Option<R>> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ReplyDropped),
        }
    }
}

/// Consumer side of a streaming reply: a finite sequence of chunks that may
/// end in a failure. Dropping it releases the producer.
pub struct StreamOutput<R> {
    rx: mpsc::UnboundedReceiver<crate::Result<R>>,
    // Held for its Drop: releases the reply-registry entry.
    _registration: Option<ReplyRegistration>,
}

impl<R> StreamOutput<R> {
    pub(crate) fn with_registration(mut self, registration: ReplyRegistration) -> Self {
        self._registration = Some(registration);
        self
    }
}

impl<R> Stream for StreamOutput<R> {
    type Item = crate::Result<R>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Caller handle embedded in a request message; only the reply ID crosses
/// the wire. The entity resolves it against the pod-local reply registry.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound(serialize = "", deserialize = ""))]
pub struct Replier<R> {
    pub id: String,
    #[serde(skip)]
    _marker: PhantomData<fn(R) -> R>,
}

impl<R> Clone for Replier<R> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<R> std::fmt::Debug for Replier<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Replier").field(&self.id).finish()
    }
}

impl<R> Replier<R> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _marker: PhantomData,
        }
    }
}

impl<R: Wire> Replier<R> {
    /// Deliver a single reply to whoever registered this reply ID.
    pub async fn reply(&self, sharding: &Sharding, value: R) -> crate::Result<()> {
        sharding.reply_single_to(&self.id, value).await
    }
}

/// Like [`Replier`], for recipients that answer with a stream of chunks.
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound(serialize = "", deserialize = ""))]
pub struct StreamReplier<R> {
    pub id: String,
    #[serde(skip)]
    _marker: PhantomData<fn(R) -> R>,
}

impl<R> Clone for StreamReplier<R> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<R> std::fmt::Debug for StreamReplier<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StreamReplier").field(&self.id).finish()
    }
}

impl<R> StreamReplier<R> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            _marker: PhantomData,
        }
    }
}

impl<R: Wire> StreamReplier<R> {
    /// Stream chunks back to whoever registered this reply ID.
    pub async fn reply_stream(
        &self,
        sharding: &Sharding,
        source: impl Stream<Item = crate::Result<R>> + Send + 'static,
    ) -> crate::Result<()> {
        sharding.reply_stream_to(&self.id, source.boxed()).await
    }
}

/// A reply channel erased for the registry. Callers install their typed
/// channel and it is reconstructed (downcast) by the code that installed
/// it; the transport handler installs a byte channel fed by the codec.
pub(crate) enum RegisteredReply {
    Typed(Box<dyn Any + Send + Sync>),
    Binary(ReplyChannel<Bytes>),
}

/// Pod-local map of in-flight reply IDs. Entries are installed before the
/// request is dispatched; the returned registration removes them once the
/// installer's interest ends, whether the call completed or was cancelled.
#[derive(Clone, Default)]
pub(crate) struct ReplyRegistry {
    inner: Arc<Mutex<HashMap<String, RegisteredReply>>>,
}

impl ReplyRegistry {
    pub fn insert(&self, id: String, reply: RegisteredReply) -> ReplyRegistration {
        self.inner.lock().unwrap().insert(id.clone(), reply);
        ReplyRegistration {
            registry: self.clone(),
            id,
        }
    }

    pub fn take(&self, id: &str) -> Option<RegisteredReply> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Drop guard for one registry entry, held through the output that the
/// installer consumes.
pub(crate) struct ReplyRegistration {
    registry: ReplyRegistry,
    id: String,
}

impl Drop for ReplyRegistration {
    fn drop(&mut self) {
        self.registry.take(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_reply_round_trip() {
        let (reply, output) = ReplyChannel::single();
        reply.reply_single(42u64);
        assert_eq!(output.await_value().await.unwrap(), Some(42));

        let (reply, output) = ReplyChannel::<u64>::single();
        reply.end();
        assert_eq!(output.await_value().await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminal_transitions_are_idempotent() {
        let (reply, output) = ReplyChannel::single();
        reply.reply_single(1u64);
        reply.reply_single(2);
        reply.fail(Error::StreamCancelled);
        reply.end();
        assert_eq!(output.await_value().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn stream_chunks_arrive_in_order_up_to_failure() {
        let (reply, output) = ReplyChannel::stream();
        let source = futures::stream::iter(vec![
            Ok(1u64),
            Ok(2),
            Err(Error::StreamCancelled),
            Ok(3), // never observed
        ]);
        reply.reply_stream(source.boxed()).await;

        let collected: Vec<_> = output.collect().await;
        assert!(matches!(collected[0], Ok(1)));
        assert!(matches!(collected[1], Ok(2)));
        assert!(matches!(collected[2], Err(Error::StreamCancelled)));
        assert_eq!(collected.len(), 3);
    }

    #[tokio::test]
    async fn reply_stream_on_single_takes_first_and_drops_rest() {
        let (reply, output) = ReplyChannel::single();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<crate::Result<u64>>();
        chunk_tx.send(Ok(7)).unwrap();

        reply
            .reply_stream(tokio_stream::wrappers::UnboundedReceiverStream::new(chunk_rx).boxed())
            .await;
        assert_eq!(output.await_value().await.unwrap(), Some(7));
        // The remainder of the source was dropped, not consumed.
        assert!(chunk_tx.send(Ok(8)).is_err());
    }

    #[tokio::test]
    async fn reply_single_on_stream_emits_one_chunk_then_ends() {
        let (reply, output) = ReplyChannel::stream();
        reply.reply_single(9u64);
        let collected: Vec<_> = output.collect().await;
        assert_eq!(collected.len(), 1);
        assert!(matches!(collected[0], Ok(9)));
    }

    #[tokio::test]
    async fn dropped_producer_fails_the_consumer() {
        let (reply, output) = ReplyChannel::<u64>::single();
        drop(reply);
        assert!(matches!(
            output.await_value().await,
            Err(Error::ReplyDropped)
        ));
    }

    #[tokio::test]
    async fn registry_entries_live_exactly_as_long_as_the_caller() {
        let registry = ReplyRegistry::default();
        let (reply, output) = ReplyChannel::<u64>::single();
        let registration = registry.insert(
            "r-1".to_string(),
            RegisteredReply::Typed(Box::new(reply.clone())),
        );
        let output = output.with_registration(registration);
        assert_eq!(registry.len(), 1);

        reply.reply_single(5);
        // Consuming the output releases its registration.
        assert_eq!(output.await_value().await.unwrap(), Some(5));
        assert_eq!(registry.len(), 0);

        // A caller that gives up (drops the output) releases it as well,
        // even though the channel never completed.
        let (reply, output) = ReplyChannel::<u64>::single();
        let registration = registry.insert(
            "r-2".to_string(),
            RegisteredReply::Typed(Box::new(reply.clone())),
        );
        let output = output.with_registration(registration);
        assert_eq!(registry.len(), 1);
        drop(output);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn replier_serializes_as_its_id() {
        let replier = Replier::<u64>::new("abc-123");
        let json = serde_json::to_string(&replier).unwrap();
        assert_eq!(json, r#""abc-123""#);
        let back: Replier<u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "abc-123");
    }
}
