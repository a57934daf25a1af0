//! Payload serialization.
//!
//! The connector treats wire payloads as opaque bytes. A [`Codec`] turns them
//! into self-describing [`serde_json::Value`]s on the way in, and encodes
//! values handed to `send` / `append_to_stream` on the way out.

use serde_json::Value;

use crate::message::Fields;
use crate::transport::RawFields;

/// Error type for codec operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encode/decode pair for payloads and stream field values.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;

    /// Encode every field value of a stream record.
    fn encode_fields(&self, fields: &Fields) -> Result<RawFields, CodecError> {
        fields
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.encode(value)?)))
            .collect()
    }

    /// Decode every field value of a stream record.
    fn decode_fields(&self, fields: &RawFields) -> Result<Fields, CodecError> {
        fields
            .iter()
            .map(|(key, bytes)| Ok((key.clone(), self.decode(bytes)?)))
            .collect()
    }
}

/// JSON codec (serde_json). The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
