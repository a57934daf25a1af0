//! Queued stream consumption: one listener reads every registered topic from
//! its cursor and one dispatcher hands records to callbacks in order.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::codec::Codec;
use crate::error::{BackgroundError, ConnectorError};
use crate::lifecycle::{Dispatch, LinkState};
use crate::message::StreamMessage;
use crate::registry::Registration;
use crate::transport::{StreamBatch, StreamId, Transport};

use super::Inner;

pub(super) fn listen<T: Transport, C: Codec>(inner: Arc<Inner<T, C>>) {
    let mut link = LinkState::new("stream-listener");
    while !inner.stop.is_set() {
        let topics = inner.streams.keys();
        let positions = inner.cursors.read_positions(&topics);
        if positions.is_empty() {
            inner.stop.wait_timeout(inner.config.stream_idle());
            continue;
        }
        match inner
            .transport
            .stream_read(&positions, None, Some(inner.config.stream_block()))
        {
            Ok(batches) => {
                link.up();
                if batches.is_empty() {
                    continue;
                }
                for batch in &batches {
                    if let Some(last) = batch.records.last() {
                        inner.cursors.mark_fetched(&batch.topic, last.id);
                    }
                }
                inner.stream_queue.push(batches);
            }
            Err(err) if err.is_connection() => {
                link.down(&err);
                inner.stop.wait_timeout(inner.config.reconnect_backoff());
            }
            Err(err) => {
                inner.report(BackgroundError::Transport {
                    task: "stream-listener",
                    source: err,
                });
                inner.stop.wait_timeout(inner.config.stream_idle());
            }
        }
    }
}

impl<T: Transport, C: Codec> Inner<T, C> {
    pub(crate) fn poll_stream_messages(
        &self,
        timeout: Option<Duration>,
    ) -> Result<bool, ConnectorError> {
        loop {
            match self.stream_queue.pop(timeout)? {
                Dispatch::Stop => return Ok(false),
                Dispatch::Item(batches) => {
                    if self.handle_stream_batches(batches) {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Deliver every record of one read, in stream order per topic.
    ///
    /// Only records the cursor table lets through are handed out, so a batch
    /// read before a topic was unregistered and subscribed again never
    /// reaches the new subscriber. Returns false if nothing was delivered.
    fn handle_stream_batches(&self, batches: Vec<StreamBatch>) -> bool {
        let mut delivered = false;
        for batch in batches {
            let topic = batch.topic;
            for record in batch.records {
                if !self.cursors.claim(&topic, record.id) {
                    continue;
                }
                let registrations = self.streams.snapshot(&topic);
                if registrations.is_empty() {
                    break;
                }
                delivered = true;
                let fields = match self.codec.decode_fields(&record.fields) {
                    Ok(fields) => fields,
                    Err(source) => {
                        self.report(BackgroundError::Decode {
                            topic: topic.clone(),
                            source,
                        });
                        continue;
                    }
                };
                let message = StreamMessage {
                    topic: topic.clone(),
                    id: record.id,
                    fields,
                };
                self.deliver(&registrations, &message);
            }
        }
        delivered
    }

    fn deliver(&self, registrations: &[Registration<StreamMessage>], message: &StreamMessage) {
        let mut saw_dead = false;
        for registration in registrations {
            if !registration.callback.is_alive() {
                saw_dead = true;
                continue;
            }
            self.invoke(&message.topic, registration, message);
        }
        if saw_dead {
            let _guard = self.registration.lock();
            if self.streams.prune_dead(&message.topic) {
                debug!(topic = %message.topic, "all stream callbacks expired");
                self.cursors.remove(&message.topic);
            }
        }
    }

    /// Seed cursors for topics not yet consumed, then add the registration.
    /// `starts` holds the initial cursor of each topic, looked up before the
    /// registration lock was taken.
    ///
    /// A topic that already has queued subscribers keeps its shared cursor,
    /// so `from_start` only takes effect for the first subscriber.
    pub(crate) fn add_queued(
        &self,
        topics: &[String],
        registration: Registration<StreamMessage>,
        starts: &[StreamId],
    ) {
        for (topic, start) in topics.iter().zip(starts) {
            self.cursors.seed(topic, *start);
        }
        self.streams.insert(
            topics,
            registration.id,
            registration.callback,
            registration.extra,
        );
    }
}
