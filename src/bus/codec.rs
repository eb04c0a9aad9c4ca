//! Serialization strategies for message payloads.
//!
//! A [`Codec`] turns a typed value into bytes plus a content-type tag and
//! back. The codec is chosen per publish call and per subscription, so the
//! consumer never has to sniff the `content-type` header.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Content type attached to JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type attached to binary (bitcode) payloads.
pub const BINARY_CONTENT_TYPE: &str = "application/x-bitcode";

/// Encode/decode failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary: {0}")]
    Binary(#[from] bitcode::Error),
}

/// A serialization strategy.
///
/// Implementations are zero-sized markers; the payload type is bound at the
/// call site (`publish::<Json, _>`, `subscribe::<Binary, GameLog, _>`).
pub trait Codec: Send + Sync + 'static {
    /// Value for the message `content-type` property.
    const CONTENT_TYPE: &'static str;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON text encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Codec for Json {
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary encoding via `bitcode`. Used for append-only log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct Binary;

impl Codec for Binary {
    const CONTENT_TYPE: &'static str = BINARY_CONTENT_TYPE;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bitcode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
        Ok(bitcode::deserialize(bytes)?)
    }
}
