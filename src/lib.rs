mod callback;
mod codec;
mod config;
mod connector;
mod error;
mod lifecycle;
mod message;
mod registry;
pub mod transport;

pub use callback::{Callback, CallbackError, CallbackResult, WeakCallback};
pub use codec::{Codec, CodecError, JsonCodec};
pub use config::ConnectorConfig;
pub use connector::{Connector, ConnectorBuilder, DispatchMode, StreamOptions};
pub use error::{log_sink, BackgroundError, ConnectorError, ErrorSink};
pub use message::{Extra, Fields, Message, StreamMessage};
pub use registry::SubscriptionId;
pub use transport::{AppendOptions, StreamId, Subscription, Transport, TransportError};

// Re-export serde_json so callers build `Extra` / `Fields` against the same version
pub use serde_json;
