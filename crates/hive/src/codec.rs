//! The deployment-wide wire codec.
//!
//! Every pod of a deployment compiles the same message types against the
//! same framing, so compatibility is structural rather than negotiated.
//! Encoding is plain JSON; the seam is this module, not a runtime object.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// Bound for values that may cross pod boundaries: requests, replies and
/// stream chunks. Blanket-implemented for any suitable serde type.
pub trait Wire: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Wire for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

pub fn encode<T: Wire>(value: &T) -> crate::Result<Bytes> {
    Ok(serde_json::to_vec(value)?.into())
}

pub fn decode<T: Wire>(bytes: &[u8]) -> crate::Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}
