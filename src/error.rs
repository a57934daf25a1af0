use std::sync::Arc;
use std::time::Duration;

use crate::callback::CallbackError;
use crate::codec::CodecError;
use crate::registry::SubscriptionId;
use crate::transport::TransportError;

/// Errors returned synchronously by connector operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Bad registration or publish arguments. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The transport failed during a synchronous call.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),
    /// Unregister of an id that is not registered.
    #[error("subscription {0} not found")]
    NotFound(SubscriptionId),
    /// Manual polling received nothing in time.
    #[error("no message received within {0:?}")]
    Timeout(Duration),
    /// The connector has been shut down.
    #[error("connector is shut down")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to spawn {task}: {source}")]
    Spawn {
        task: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised inside background tasks.
///
/// These never reach a caller; they go to the connector's [`ErrorSink`].
#[derive(Debug, thiserror::Error)]
pub enum BackgroundError {
    #[error("{task}: {source}")]
    Transport {
        task: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("dropped undecodable message on `{topic}`: {source}")]
    Decode {
        topic: String,
        #[source]
        source: CodecError,
    },
    #[error("callback {subscription} on `{topic}` failed: {source}")]
    Callback {
        topic: String,
        subscription: SubscriptionId,
        #[source]
        source: CallbackError,
    },
    #[error("callback {subscription} on `{topic}` panicked: {message}")]
    CallbackPanicked {
        topic: String,
        subscription: SubscriptionId,
        message: String,
    },
}

/// Receives every background error of a connector.
pub type ErrorSink = Arc<dyn Fn(&BackgroundError) + Send + Sync>;

/// The default sink: log through `tracing`.
pub fn log_sink() -> ErrorSink {
    Arc::new(|err: &BackgroundError| {
        tracing::error!(error = %err, "background task error");
    })
}
