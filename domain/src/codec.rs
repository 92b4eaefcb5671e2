//! Interchange boundary for the external object-notation codecs.
//!
//! The binary (BLON) and text (LON) codecs consume and produce the value
//! model but have no dependency on the execution engine; they live outside
//! this repository. This module only fixes the interface they implement:
//! `encode` and `decode` are pure functions over [`Value`].

use thiserror::Error;

use crate::value::Value;

/// Error from an encode/decode operation.
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed at byte {offset}: {message}")]
    Decode { offset: usize, message: String },

    #[error("value kind {0} is not serializable")]
    Unserializable(&'static str),
}

/// A serializer for the value model.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}
