use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// Identifier of a shard. Shards are numbered `1..=number_of_shards`.
pub type ShardId = u32;

/// Network identity of a pod. Two values compare equal iff host and port do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodAddress {
    pub host: String,
    pub port: u16,
}

impl PodAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for PodAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How messages addressed to a recipient type are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientKind {
    /// Routed to the single pod owning the entity's shard.
    Entity,
    /// Fanned out to every pod currently holding any shard.
    Topic,
}

type ShardFn = dyn Fn(&str, u32) -> ShardId + Send + Sync;

/// A named recipient type handling messages of type `M`.
///
/// The shard of an entity defaults to a stable fingerprint of its ID; a type
/// may override the function, in which case every pod of the deployment must
/// register the same override.
pub struct RecipientType<M> {
    name: String,
    kind: RecipientKind,
    shard_fn: Option<Arc<ShardFn>>,
    _marker: PhantomData<fn(M) -> M>,
}

impl<M> Clone for RecipientType<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            shard_fn: self.shard_fn.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M> std::fmt::Debug for RecipientType<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipientType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<M> RecipientType<M> {
    pub fn entity(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RecipientKind::Entity,
            shard_fn: None,
            _marker: PhantomData,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RecipientKind::Topic,
            shard_fn: None,
            _marker: PhantomData,
        }
    }

    /// Override the shard function for this type. Both ends must agree.
    pub fn with_shard_fn(
        mut self,
        f: impl Fn(&str, u32) -> ShardId + Send + Sync + 'static,
    ) -> Self {
        self.shard_fn = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RecipientKind {
        self.kind
    }

    pub(crate) fn shard_fn(&self, number_of_shards: u32) -> Arc<dyn Fn(&str) -> ShardId + Send + Sync> {
        match self.shard_fn.clone() {
            Some(f) => Arc::new(move |entity_id| f(entity_id, number_of_shards)),
            None => Arc::new(move |entity_id| default_shard(entity_id, number_of_shards)),
        }
    }
}

/// Default shard function: a stable 64-bit fingerprint of the entity ID,
/// folded into `1..=number_of_shards`. Every pod of a deployment computes
/// the same value for the same ID.
pub fn default_shard(entity_id: &str, number_of_shards: u32) -> ShardId {
    (fxhash::hash64(entity_id.as_bytes()) % number_of_shards as u64) as u32 + 1
}

/// Wire envelope for one message between pods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryMessage {
    pub entity_id: String,
    pub entity_type: String,
    pub body: Bytes,
    pub reply_id: Option<String>,
}
