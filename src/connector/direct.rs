//! Newest-only stream listeners.
//!
//! Each topic of a newest-only subscription gets its own listener thread that
//! calls the callback directly. After every wake-up the listener skips ahead
//! to the newest record, so a slow callback sees the latest state instead of
//! working through a backlog.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::codec::Codec;
use crate::error::{BackgroundError, ConnectorError};
use crate::lifecycle::{join_worker, spawn_worker, LinkState, StopSignal};
use crate::message::StreamMessage;
use crate::registry::{Registration, SubscriptionId};
use crate::transport::{StreamId, StreamRecord, Transport};

use super::Inner;

const TASK: &str = "direct-listener";

pub(crate) struct DirectListener {
    topic: String,
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl DirectListener {
    fn spawn<T: Transport, C: Codec>(
        inner: Arc<Inner<T, C>>,
        topic: String,
        start: StreamId,
        registration: Registration<StreamMessage>,
    ) -> Result<Self, ConnectorError> {
        let stop = Arc::new(StopSignal::new());
        let handle = {
            let stop = Arc::clone(&stop);
            let topic = topic.clone();
            spawn_worker(TASK, move || {
                listen(&inner, &stop, &topic, start, &registration)
            })?
        };
        Ok(Self {
            topic,
            stop,
            handle: Some(handle),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn signal_stop(&self) {
        self.stop.set();
    }

    fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            join_worker(TASK, handle);
        }
    }
}

/// Signal every listener, then wait for each to exit.
pub(crate) fn stop_all(listeners: Vec<DirectListener>) {
    for listener in &listeners {
        listener.signal_stop();
    }
    for listener in listeners {
        listener.join();
    }
}

fn listen<T: Transport, C: Codec>(
    inner: &Arc<Inner<T, C>>,
    stop: &StopSignal,
    topic: &str,
    start: StreamId,
    registration: &Registration<StreamMessage>,
) {
    let mut link = LinkState::new(TASK);
    let mut cursor = start;
    while !stop.is_set() && !inner.stop.is_set() {
        let positions = BTreeMap::from([(topic.to_string(), cursor)]);
        let read = inner
            .transport
            .stream_read(&positions, Some(1), Some(inner.config.stream_block()));
        let next = match read {
            Ok(batches) => {
                link.up();
                batches.into_iter().flat_map(|batch| batch.records).next()
            }
            Err(err) if err.is_connection() => {
                link.down(&err);
                stop.wait_timeout(inner.config.reconnect_backoff());
                continue;
            }
            Err(err) => {
                inner.report(BackgroundError::Transport {
                    task: TASK,
                    source: err,
                });
                stop.wait_timeout(inner.config.direct_idle());
                continue;
            }
        };
        let Some(record) = next else {
            stop.wait_timeout(inner.config.direct_idle());
            continue;
        };

        let record = newest(inner, topic, record);
        cursor = record.id;
        inner.cursors.advance(topic, cursor);

        if !registration.callback.is_alive() {
            debug!(topic, subscription = %registration.id, "stream callback expired");
            inner.expire_direct(registration.id);
            break;
        }
        match inner.codec.decode_fields(&record.fields) {
            Ok(fields) => {
                let message = StreamMessage {
                    topic: topic.to_string(),
                    id: record.id,
                    fields,
                };
                inner.invoke(topic, registration, &message);
            }
            Err(source) => inner.report(BackgroundError::Decode {
                topic: topic.to_string(),
                source,
            }),
        }
    }
}

/// The newest record of `topic` if it is newer than `record`.
fn newest<T: Transport, C: Codec>(
    inner: &Inner<T, C>,
    topic: &str,
    record: StreamRecord,
) -> StreamRecord {
    match inner.transport.stream_read_latest(topic, 1) {
        Ok(mut latest) => match latest.pop() {
            Some(newest) if newest.id > record.id => newest,
            _ => record,
        },
        Err(err) => {
            debug!(topic, error = %err, "could not look up newest record");
            record
        }
    }
}

impl<T: Transport, C: Codec> Inner<T, C> {
    /// Start one listener per topic, each from its entry in `starts`. If any
    /// spawn fails, listeners already started for this registration are
    /// stopped again.
    pub(crate) fn add_direct_listeners(
        self: &Arc<Self>,
        topics: &[String],
        registration: Registration<StreamMessage>,
        starts: &[StreamId],
    ) -> Result<(), ConnectorError> {
        let mut listeners = Vec::with_capacity(topics.len());
        for (topic, &start) in topics.iter().zip(starts) {
            self.cursors.seed(topic, start);
            match DirectListener::spawn(Arc::clone(self), topic.clone(), start, registration.clone())
            {
                Ok(listener) => listeners.push(listener),
                Err(err) => {
                    stop_all(listeners);
                    for topic in topics {
                        if !self.has_direct_topic(topic) {
                            self.cursors.remove(topic);
                        }
                    }
                    return Err(err);
                }
            }
        }
        self.direct.lock().insert(registration.id, listeners);
        Ok(())
    }

    /// Detach the listeners of `id`. Cursors of topics no other newest-only
    /// subscription reads are dropped.
    pub(crate) fn remove_direct(&self, id: SubscriptionId) -> Option<Vec<DirectListener>> {
        let mut direct = self.direct.lock();
        let listeners = direct.remove(&id)?;
        for listener in &listeners {
            let shared = direct
                .values()
                .flatten()
                .any(|other| other.topic() == listener.topic());
            if !shared {
                self.cursors.remove(listener.topic());
            }
        }
        Some(listeners)
    }

    fn has_direct_topic(&self, topic: &str) -> bool {
        self.direct
            .lock()
            .values()
            .flatten()
            .any(|listener| listener.topic() == topic)
    }

    /// Called from a listener whose callback owner is gone.
    fn expire_direct(&self, id: SubscriptionId) {
        let listeners = {
            let _guard = self.registration.lock();
            self.remove_direct(id)
        };
        if let Some(listeners) = listeners {
            stop_all(listeners);
        }
    }
}
