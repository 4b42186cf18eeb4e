//! Per-pod core of a sharded, distributed entity runtime.
//!
//! A deployment consists of many pods. Each entity, addressed by a string ID
//! under a named recipient type, lives on exactly one pod at a time; which
//! pod is decided by a deterministic shard function together with a
//! shard-to-pod assignment published by an external shard manager. This crate
//! owns the pod-local half of that contract: it hosts entity mailboxes,
//! routes sends to the owning pod (retrying while routing is stale), and
//! carries single or streamed replies back to callers over the same call that
//! delivered the request.
//!
//! The shard manager itself, the gRPC server shell and the assignment store
//! are consumed through the traits in [`transport`].

mod assignment;
pub mod codec;
pub mod config;
pub mod entities;
pub mod metrics;
pub mod reply;
pub mod router;
pub mod singleton;
pub mod transport;
pub mod types;

pub use codec::Wire;
pub use config::Config;
pub use entities::{EntityOptions, Mailbox, TerminationAck};
pub use reply::{Replier, ReplyChannel, SendChannel, StreamOutput, StreamReplier};
pub use router::{Broadcaster, Messenger, Sharding};
pub use types::{BinaryMessage, PodAddress, RecipientKind, RecipientType, ShardId};

use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("entity '{0}' is not managed by this pod")]
    EntityNotManagedByThisPod(String),
    #[error("pod {0} is not reachable")]
    PodUnavailable(types::PodAddress),
    #[error("send to {entity_type}/{entity_id} timed out")]
    SendTimeout {
        entity_type: String,
        entity_id: String,
    },
    #[error("stream closed by the remote pod")]
    StreamCancelled,
    #[error("unknown recipient type '{0}'")]
    UnknownRecipientType(String),
    #[error("recipient type '{0}' is registered with a different message type")]
    RecipientTypeMismatch(String),
    #[error("reply '{0}' is registered with a different response type")]
    ReplyTypeMismatch(String),
    #[error("reply channel was dropped before a reply was produced")]
    ReplyDropped,
    #[error("failed to encode or decode a message body: {0}")]
    Codec(Arc<serde_json::Error>),
    // Arc-wrapped so the enum stays cheaply cloneable; tonic::Status is not
    // Clone and reply fan-out needs a second copy of every failure.
    #[error("{0}")]
    Grpc(Arc<tonic::Status>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(Arc::new(err))
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Grpc(Arc::new(status))
    }
}
