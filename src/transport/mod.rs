//! Transport - the boundary to the message bus service.
//!
//! The connector never talks to the network itself. Everything it needs from
//! the bus is expressed by the [`Transport`] trait: fire-and-forget publish,
//! topic/pattern subscription with a pull-based `poll_next`, and the
//! append/read primitives of append-only streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Connector (per process)                   │
//! │  register() / register_stream() / publish() / shutdown()    │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Transport trait                         │
//! │  publish / subscribe / poll_next                            │
//! │  stream_append / stream_read / stream_read_latest           │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌──────────────────────┐            ┌──────────────────────────┐
//! │ InMemoryTransport    │            │ Redis-style client       │
//! │ (included)           │            │ (external)               │
//! └──────────────────────┘            └──────────────────────────┘
//! ```

mod in_memory;
mod pattern;
mod stream_id;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use in_memory::{InMemoryBus, InMemoryTransport};
pub use pattern::glob_match;
pub use stream_id::{ParseStreamIdError, StreamId};

/// Encoded stream record fields, keyed by field name.
pub type RawFields = BTreeMap<String, Vec<u8>>;

/// A literal topic or a wildcard pattern to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscription {
    Topic(String),
    Pattern(String),
}

impl Subscription {
    pub fn topic(name: impl Into<String>) -> Self {
        Subscription::Topic(name.into())
    }

    /// A glob pattern (`*`, `?`, `[a-z]`, `\` escapes).
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Subscription::Pattern(pattern.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Subscription::Topic(name) | Subscription::Pattern(name) => name,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Subscription::Pattern(_))
    }
}

/// What kind of frame `poll_next` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// A published payload.
    Message,
    /// Confirmation of a `subscribe` call.
    SubscribeAck,
    /// Confirmation of an `unsubscribe` call.
    UnsubscribeAck,
}

/// An inbound pub/sub frame as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: RawKind,
    /// Topic the message was published on (or the subscription name for acks).
    pub topic: String,
    /// The pattern that matched, when delivery was due to a pattern subscription.
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// A message delivered because of a literal topic subscription.
    pub fn message(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: RawKind::Message,
            topic: topic.into(),
            pattern: None,
            payload,
        }
    }

    /// A message delivered because `pattern` matched `topic`.
    pub fn pattern_message(
        pattern: impl Into<String>,
        topic: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: RawKind::Message,
            topic: topic.into(),
            pattern: Some(pattern.into()),
            payload,
        }
    }

    pub fn ack(kind: RawKind, subscription: &Subscription) -> Self {
        Self {
            kind,
            topic: subscription.name().to_string(),
            pattern: subscription.is_pattern().then(|| subscription.name().to_string()),
            payload: Vec::new(),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind != RawKind::Message
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern.is_some()
    }

    /// The subscription this message was routed through.
    pub fn subscription(&self) -> Subscription {
        match &self.pattern {
            Some(pattern) => Subscription::Pattern(pattern.clone()),
            None => Subscription::Topic(self.topic.clone()),
        }
    }
}

/// One record of an append-only stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamId,
    pub fields: RawFields,
}

/// Records read from a single stream topic, in ascending id order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    pub topic: String,
    pub records: Vec<StreamRecord>,
}

/// Options for `stream_append`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOptions {
    /// Trim the stream to at most this many records after appending.
    pub max_len: Option<usize>,
    /// Expire the whole stream key this long after the append.
    pub expire: Option<Duration>,
}

impl AppendOptions {
    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn expire(mut self, ttl: Duration) -> Self {
        self.expire = Some(ttl);
        self
    }
}

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection to the bus failed or was lost.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The bus rejected the request.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Timeout waiting for the bus to answer.
    #[error("transport timeout")]
    Timeout,
    /// Other error.
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Connectivity failures are retried with backoff by the listener loops;
    /// everything else is reported and the loop carries on.
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::ConnectionFailed(_))
    }
}

/// Client-side view of a pub/sub + stream message bus.
///
/// Implementations must be safe for concurrent independent calls: the
/// connector shares one transport between all of its background tasks. A
/// client library that is not thread-safe should serialize calls behind its
/// own mutex.
pub trait Transport: Send + Sync + 'static {
    /// Publish a payload on a topic.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribe this connection to topics and/or patterns.
    fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError>;

    /// Drop subscriptions previously made with `subscribe`.
    fn unsubscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next inbound frame. `Ok(None)` on timeout.
    fn poll_next(&self, timeout: Duration) -> Result<Option<RawMessage>, TransportError>;

    /// Append a record to a stream, returning its id.
    fn stream_append(
        &self,
        topic: &str,
        fields: &RawFields,
        options: AppendOptions,
    ) -> Result<StreamId, TransportError>;

    /// Read records newer than the given cursor of each topic.
    ///
    /// `count` limits records per topic. With `block`, waits up to that long
    /// for at least one record to arrive; without it, returns immediately.
    /// Topics with nothing new are omitted from the result.
    fn stream_read(
        &self,
        cursors: &BTreeMap<String, StreamId>,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamBatch>, TransportError>;

    /// The newest `count` records of a stream, oldest first.
    fn stream_read_latest(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, TransportError>;

    /// Records with `start <= id <= end`, oldest first.
    fn stream_range(
        &self,
        topic: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamRecord>, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        (**self).publish(topic, payload)
    }

    fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        (**self).subscribe(subscriptions)
    }

    fn unsubscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        (**self).unsubscribe(subscriptions)
    }

    fn poll_next(&self, timeout: Duration) -> Result<Option<RawMessage>, TransportError> {
        (**self).poll_next(timeout)
    }

    fn stream_append(
        &self,
        topic: &str,
        fields: &RawFields,
        options: AppendOptions,
    ) -> Result<StreamId, TransportError> {
        (**self).stream_append(topic, fields, options)
    }

    fn stream_read(
        &self,
        cursors: &BTreeMap<String, StreamId>,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamBatch>, TransportError> {
        (**self).stream_read(cursors, count, block)
    }

    fn stream_read_latest(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        (**self).stream_read_latest(topic, count)
    }

    fn stream_range(
        &self,
        topic: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        (**self).stream_range(topic, start, end, count)
    }
}
