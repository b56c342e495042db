//! Payload codec.
//!
//! Values and envelopes travel as JSON. The rest of the crate only depends on
//! [`encode`] and [`decode`], so the format stays an opaque byte contract.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Encoding or decoding failed.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct CodecError(#[from] serde_json::Error);

/// Encode a value to bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode bytes into a value of type `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}
