//! In-memory message bus for testing and single-process scenarios.
//!
//! This module provides a thread-safe bus that implements the full
//! [`Transport`] trait, useful for:
//! - Unit and integration testing without a running bus service
//! - Single-process applications
//! - Simulating outages (`set_available(false)`)

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use super::pattern::glob_match;
use super::{
    AppendOptions, RawFields, RawKind, RawMessage, StreamBatch, StreamId, StreamRecord,
    Subscription, Transport, TransportError,
};

/// Shared in-memory bus. Cloning yields another handle to the same bus.
///
/// Each [`InMemoryTransport`] obtained from [`InMemoryBus::connect`] is an
/// independent connection with its own subscriptions and inbox, while
/// streams are shared by every connection.
///
/// ## Example
///
/// ```
/// use busline::transport::{InMemoryBus, Subscription, Transport};
/// use std::time::Duration;
///
/// let bus = InMemoryBus::new();
/// let conn = bus.connect();
/// conn.subscribe(&[Subscription::pattern("orders:*")]).unwrap();
/// conn.publish("orders:eu", b"42").unwrap();
///
/// // First frame is the subscribe acknowledgement.
/// assert!(conn.poll_next(Duration::from_millis(10)).unwrap().unwrap().is_ack());
/// let msg = conn.poll_next(Duration::from_millis(10)).unwrap().unwrap();
/// assert_eq!(msg.topic, "orders:eu");
/// assert_eq!(msg.pattern.as_deref(), Some("orders:*"));
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BusState>,
    /// Signalled on every append and availability change.
    appended: Condvar,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct BusState {
    connections: Vec<Weak<Connection>>,
    streams: HashMap<String, StreamLog>,
}

#[derive(Default)]
struct StreamLog {
    records: VecDeque<StreamRecord>,
    last_id: StreamId,
    expires_at: Option<Instant>,
}

struct Connection {
    subscriptions: Mutex<Subscriptions>,
    inbox_tx: Sender<RawMessage>,
    inbox_rx: Receiver<RawMessage>,
}

#[derive(Default)]
struct Subscriptions {
    topics: HashSet<String>,
    patterns: Vec<String>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the bus.
    pub fn connect(&self) -> InMemoryTransport {
        let (inbox_tx, inbox_rx) = unbounded();
        let conn = Arc::new(Connection {
            subscriptions: Mutex::new(Subscriptions::default()),
            inbox_tx,
            inbox_rx,
        });
        self.shared
            .state
            .lock()
            .connections
            .push(Arc::downgrade(&conn));
        InMemoryTransport {
            shared: Arc::clone(&self.shared),
            conn,
        }
    }

    /// Simulate the bus going down (`false`) or coming back (`true`).
    ///
    /// While unavailable, every transport call fails with
    /// [`TransportError::ConnectionFailed`].
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
        let _state = self.shared.state.lock();
        self.shared.appended.notify_all();
    }

    /// Number of records currently held by a stream.
    pub fn stream_len(&self, topic: &str) -> usize {
        let mut state = self.shared.state.lock();
        state.purge_expired(Instant::now());
        state.streams.get(topic).map_or(0, |log| log.records.len())
    }
}

/// One connection to an [`InMemoryBus`].
#[derive(Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
    conn: Arc<Connection>,
}

impl InMemoryTransport {
    fn ensure_available(&self) -> Result<(), TransportError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionFailed(
                "in-memory bus is unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl BusState {
    fn purge_expired(&mut self, now: Instant) {
        self.streams
            .retain(|_, log| log.expires_at.map_or(true, |at| at > now));
    }

    fn collect(
        &self,
        cursors: &BTreeMap<String, StreamId>,
        count: Option<usize>,
    ) -> Vec<StreamBatch> {
        let limit = count.unwrap_or(usize::MAX);
        cursors
            .iter()
            .filter_map(|(topic, cursor)| {
                let log = self.streams.get(topic)?;
                let records: Vec<StreamRecord> = log
                    .records
                    .iter()
                    .filter(|record| record.id > *cursor)
                    .take(limit)
                    .cloned()
                    .collect();
                (!records.is_empty()).then(|| StreamBatch {
                    topic: topic.clone(),
                    records,
                })
            })
            .collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

impl Transport for InMemoryTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_available()?;
        let mut state = self.shared.state.lock();
        state.connections.retain(|conn| conn.strong_count() > 0);
        for conn in state.connections.iter().filter_map(Weak::upgrade) {
            let subscriptions = conn.subscriptions.lock();
            if subscriptions.topics.contains(topic) {
                let _ = conn
                    .inbox_tx
                    .send(RawMessage::message(topic, payload.to_vec()));
            }
            for pattern in &subscriptions.patterns {
                if glob_match(pattern, topic) {
                    let _ = conn.inbox_tx.send(RawMessage::pattern_message(
                        pattern.as_str(),
                        topic,
                        payload.to_vec(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        self.ensure_available()?;
        let mut current = self.conn.subscriptions.lock();
        for subscription in subscriptions {
            match subscription {
                Subscription::Topic(topic) => {
                    current.topics.insert(topic.clone());
                }
                Subscription::Pattern(pattern) => {
                    if !current.patterns.contains(pattern) {
                        current.patterns.push(pattern.clone());
                    }
                }
            }
            let _ = self
                .conn
                .inbox_tx
                .send(RawMessage::ack(RawKind::SubscribeAck, subscription));
        }
        Ok(())
    }

    fn unsubscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError> {
        self.ensure_available()?;
        let mut current = self.conn.subscriptions.lock();
        for subscription in subscriptions {
            match subscription {
                Subscription::Topic(topic) => {
                    current.topics.remove(topic);
                }
                Subscription::Pattern(pattern) => current.patterns.retain(|p| p != pattern),
            }
            let _ = self
                .conn
                .inbox_tx
                .send(RawMessage::ack(RawKind::UnsubscribeAck, subscription));
        }
        Ok(())
    }

    fn poll_next(&self, timeout: Duration) -> Result<Option<RawMessage>, TransportError> {
        self.ensure_available()?;
        match self.conn.inbox_rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::ConnectionFailed(
                "connection inbox closed".to_string(),
            )),
        }
    }

    fn stream_append(
        &self,
        topic: &str,
        fields: &RawFields,
        options: AppendOptions,
    ) -> Result<StreamId, TransportError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.purge_expired(now);

        let log = state.streams.entry(topic.to_string()).or_default();
        let id = log.last_id.successor(now_ms());
        log.last_id = id;
        log.records.push_back(StreamRecord {
            id,
            fields: fields.clone(),
        });
        if let Some(max_len) = options.max_len {
            while log.records.len() > max_len {
                log.records.pop_front();
            }
        }
        if let Some(ttl) = options.expire {
            log.expires_at = Some(now + ttl);
        }

        self.shared.appended.notify_all();
        Ok(id)
    }

    fn stream_read(
        &self,
        cursors: &BTreeMap<String, StreamId>,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamBatch>, TransportError> {
        self.ensure_available()?;
        let deadline = block.map(|block| Instant::now() + block);
        let mut state = self.shared.state.lock();
        loop {
            state.purge_expired(Instant::now());
            let batches = state.collect(cursors, count);
            if !batches.is_empty() {
                return Ok(batches);
            }
            let Some(deadline) = deadline else {
                return Ok(batches);
            };
            if Instant::now() >= deadline {
                return Ok(batches);
            }
            self.shared.appended.wait_until(&mut state, deadline);
            self.ensure_available()?;
        }
    }

    fn stream_read_latest(
        &self,
        topic: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        self.ensure_available()?;
        let mut state = self.shared.state.lock();
        state.purge_expired(Instant::now());
        let Some(log) = state.streams.get(topic) else {
            return Ok(Vec::new());
        };
        let skip = log.records.len().saturating_sub(count);
        Ok(log.records.iter().skip(skip).cloned().collect())
    }

    fn stream_range(
        &self,
        topic: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        self.ensure_available()?;
        let mut state = self.shared.state.lock();
        state.purge_expired(Instant::now());
        let Some(log) = state.streams.get(topic) else {
            return Ok(Vec::new());
        };
        Ok(log
            .records
            .iter()
            .filter(|record| record.id >= start && record.id <= end)
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
