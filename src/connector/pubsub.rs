//! Pub/sub listener and dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::Codec;
use crate::error::{BackgroundError, ConnectorError};
use crate::lifecycle::{Dispatch, LinkState};
use crate::message::Message;
use crate::transport::{RawMessage, Transport};

use super::Inner;

/// Listener loop: move every inbound frame onto the dispatch queue until the
/// connector stops.
pub(super) fn listen<T: Transport, C: Codec>(inner: Arc<Inner<T, C>>) {
    let mut link = LinkState::new("pubsub-listener");
    while !inner.stop.is_set() {
        match inner.transport.poll_next(inner.config.poll_timeout()) {
            Ok(Some(msg)) => {
                link.up();
                inner.pubsub_queue.push(msg);
            }
            Ok(None) => link.up(),
            Err(err) if err.is_connection() => {
                link.down(&err);
                inner.stop.wait_timeout(inner.config.reconnect_backoff());
            }
            Err(err) => inner.report(BackgroundError::Transport {
                task: "pubsub-listener",
                source: err,
            }),
        }
    }
}

impl<T: Transport, C: Codec> Inner<T, C> {
    pub(crate) fn poll_messages(&self, timeout: Option<Duration>) -> Result<bool, ConnectorError> {
        loop {
            match self.pubsub_queue.pop(timeout)? {
                Dispatch::Stop => return Ok(false),
                Dispatch::Item(msg) => {
                    if self.handle_message(msg) {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Dispatch one frame. Returns false for frames that carry no message.
    fn handle_message(&self, raw: RawMessage) -> bool {
        if raw.is_ack() {
            return false;
        }
        let key = raw.subscription();
        let registrations = self.pubsub.snapshot(&key);
        if registrations.is_empty() {
            return true;
        }

        let value = match self.codec.decode(&raw.payload) {
            Ok(value) => value,
            Err(source) => {
                self.report(BackgroundError::Decode {
                    topic: raw.topic,
                    source,
                });
                return true;
            }
        };
        let message = Message {
            topic: raw.topic,
            pattern: raw.pattern,
            value,
        };

        let mut saw_dead = false;
        for registration in &registrations {
            if !registration.callback.is_alive() {
                saw_dead = true;
                continue;
            }
            self.invoke(&message.topic, registration, &message);
        }

        if saw_dead {
            let _subscribing = self.subscriptions.lock();
            if self.pubsub.prune_dead(&key) {
                debug!(subscription = key.name(), "all callbacks expired, unsubscribing");
                if let Err(err) = self.transport.unsubscribe(std::slice::from_ref(&key)) {
                    warn!(subscription = key.name(), error = %err, "failed to unsubscribe");
                }
            }
        }
        true
    }
}
