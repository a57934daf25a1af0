//! Decoded messages handed to callbacks.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::CodecError;
use crate::transport::StreamId;

/// Extra arguments registered alongside a callback and passed back to it on
/// every invocation. Callers own the meaning and encoding of the values.
pub type Extra = serde_json::Map<String, Value>;

/// Decoded fields of a stream record.
pub type Fields = serde_json::Map<String, Value>;

/// A decoded pub/sub message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Pattern that routed the message here, if any.
    pub pattern: Option<String>,
    pub value: Value,
}

impl Message {
    /// Deserialize the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        T::deserialize(&self.value).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// A decoded stream record.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub topic: String,
    pub id: StreamId,
    pub fields: Fields,
}

impl StreamMessage {
    /// Deserialize one field into a concrete type. `None` if the field is absent.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<Result<T, CodecError>> {
        self.fields
            .get(key)
            .map(|value| T::deserialize(value).map_err(|e| CodecError::Decode(e.to_string())))
    }
}
