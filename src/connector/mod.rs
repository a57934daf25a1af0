//! The connector: registrations, background tasks and their lifecycle.
//!
//! ```text
//!  Transport ──poll_next──▶ pub/sub listener ──▶ queue ──▶ pub/sub dispatcher ──▶ callbacks
//!  Transport ──stream_read─▶ stream listener ──▶ queue ──▶ stream dispatcher  ──▶ callbacks
//!  Transport ──stream_read─▶ direct listener (one per newest-only topic)      ──▶ callback
//! ```
//!
//! Every task is started lazily by the first registration that needs it and
//! stopped by [`Connector::shutdown`].
//!
//! Unregistering while a dispatch for that subscription is in flight may
//! still let that one in-flight invocation happen: dispatchers invoke a
//! snapshot of the registrations taken when the message was dequeued.

mod cursor;
mod direct;
mod pubsub;
mod stream;

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::callback::Callback;
use crate::codec::{Codec, JsonCodec};
use crate::config::ConnectorConfig;
use crate::error::{log_sink, BackgroundError, ConnectorError, ErrorSink};
use crate::lifecycle::{join_worker, panic_message, spawn_worker, DispatchQueue, StopSignal};
use crate::message::{Extra, Fields, Message, StreamMessage};
use crate::registry::{Registration, Registry, SubscriptionId};
use crate::transport::{
    AppendOptions, RawMessage, StreamBatch, StreamId, Subscription, Transport,
};

use cursor::CursorTable;
use direct::DirectListener;

/// Who drains a dispatch queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// A background dispatcher task invokes callbacks.
    #[default]
    Background,
    /// The caller drains the queue with `poll_messages` /
    /// `poll_stream_messages`.
    Manual,
}

/// How a stream subscription consumes its topics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Start from the first record instead of records newer than now.
    pub from_start: bool,
    /// Always serve the newest record, dropping any backlog.
    pub newest_only: bool,
    pub dispatch: DispatchMode,
}

impl StreamOptions {
    pub fn from_start(mut self) -> Self {
        self.from_start = true;
        self
    }

    pub fn newest_only(mut self) -> Self {
        self.newest_only = true;
        self
    }

    pub fn manual(mut self) -> Self {
        self.dispatch = DispatchMode::Manual;
        self
    }
}

/// Builder for a [`Connector`] with a custom config, codec or error sink.
pub struct ConnectorBuilder<T, C = JsonCodec> {
    transport: T,
    codec: C,
    config: ConnectorConfig,
    sink: ErrorSink,
}

impl<T: Transport, C: Codec> ConnectorBuilder<T, C> {
    pub fn config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec<C2: Codec>(self, codec: C2) -> ConnectorBuilder<T, C2> {
        ConnectorBuilder {
            transport: self.transport,
            codec,
            config: self.config,
            sink: self.sink,
        }
    }

    /// Route background errors to `sink` instead of the log.
    pub fn error_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&BackgroundError) + Send + Sync + 'static,
    {
        self.sink = Arc::new(sink);
        self
    }

    /// Validate the config and create the connector. No background task
    /// starts until the first registration.
    pub fn build(self) -> Result<Connector<T, C>, ConnectorError> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> Connector<T, C> {
        Connector {
            inner: Arc::new(Inner {
                transport: self.transport,
                codec: self.codec,
                config: self.config,
                sink: self.sink,
                next_id: AtomicU64::new(1),
                pubsub: Registry::new(),
                streams: Registry::new(),
                cursors: CursorTable::new(),
                pubsub_queue: DispatchQueue::new(),
                stream_queue: DispatchQueue::new(),
                stop: StopSignal::new(),
                closed: AtomicBool::new(false),
                registration: Mutex::new(()),
                subscriptions: Mutex::new(()),
                workers: Mutex::new(Workers::default()),
                direct: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Client-side connector to a pub/sub + stream message bus.
///
/// ## Example
///
/// ```
/// use busline::{CallbackResult, Connector, Extra, Message, Subscription};
/// use busline::transport::InMemoryBus;
/// use std::sync::mpsc;
/// use std::time::Duration;
///
/// let bus = InMemoryBus::new();
/// let connector = Connector::new(bus.connect());
///
/// let (tx, rx) = mpsc::channel();
/// let tx = std::sync::Mutex::new(tx);
/// connector
///     .register(
///         [Subscription::topic("orders")],
///         move |msg: &Message, _extra: &Extra| -> CallbackResult {
///             tx.lock().unwrap().send(msg.value.clone())?;
///             Ok(())
///         },
///         Extra::new(),
///     )
///     .unwrap();
///
/// connector.publish("orders", b"42").unwrap();
/// assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
/// connector.shutdown();
/// ```
pub struct Connector<T: Transport, C: Codec = JsonCodec> {
    inner: Arc<Inner<T, C>>,
}

pub(crate) struct Inner<T, C> {
    pub(crate) transport: T,
    pub(crate) codec: C,
    pub(crate) config: ConnectorConfig,
    sink: ErrorSink,
    next_id: AtomicU64,
    pub(crate) pubsub: Registry<Subscription, Message>,
    pub(crate) streams: Registry<String, StreamMessage>,
    pub(crate) cursors: CursorTable,
    pub(crate) pubsub_queue: DispatchQueue<RawMessage>,
    pub(crate) stream_queue: DispatchQueue<Vec<StreamBatch>>,
    pub(crate) stop: StopSignal,
    closed: AtomicBool,
    /// Serializes registry updates and shutdown. Never held across a
    /// transport call.
    registration: Mutex<()>,
    /// Orders transport subscribe/unsubscribe with pub/sub registry updates,
    /// so the transport's subscription set follows the registry. Taken
    /// before `registration`.
    subscriptions: Mutex<()>,
    workers: Mutex<Workers>,
    direct: Mutex<HashMap<SubscriptionId, Vec<DirectListener>>>,
}

#[derive(Default)]
struct Workers {
    pubsub_listener: Option<JoinHandle<()>>,
    pubsub_dispatcher: Option<JoinHandle<()>>,
    stream_listener: Option<JoinHandle<()>>,
    stream_dispatcher: Option<JoinHandle<()>>,
}

impl<T: Transport> Connector<T> {
    /// A connector with default config, the JSON codec and the log sink.
    pub fn new(transport: T) -> Self {
        Self::builder(transport).assemble()
    }

    pub fn builder(transport: T) -> ConnectorBuilder<T> {
        ConnectorBuilder {
            transport,
            codec: JsonCodec,
            config: ConnectorConfig::default(),
            sink: log_sink(),
        }
    }
}

impl<T: Transport, C: Codec> Connector<T, C> {
    /// Register a callback for topics and/or patterns, dispatched in the
    /// background. See [`register_with`](Self::register_with).
    pub fn register<I, Cb>(
        &self,
        subscriptions: I,
        callback: Cb,
        extra: Extra,
    ) -> Result<SubscriptionId, ConnectorError>
    where
        I: IntoIterator<Item = Subscription>,
        Cb: Callback<Message> + 'static,
    {
        self.register_with(subscriptions, callback, extra, DispatchMode::Background)
    }

    /// Register a callback for topics and/or patterns.
    ///
    /// Registering the same callback twice yields two registrations and two
    /// invocations per message. The first registration starts the pub/sub
    /// listener; a `Background` registration also starts the dispatcher.
    pub fn register_with<I, Cb>(
        &self,
        subscriptions: I,
        callback: Cb,
        extra: Extra,
        mode: DispatchMode,
    ) -> Result<SubscriptionId, ConnectorError>
    where
        I: IntoIterator<Item = Subscription>,
        Cb: Callback<Message> + 'static,
    {
        let subscriptions: Vec<Subscription> = subscriptions
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if subscriptions.is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "topics and patterns cannot both be empty".to_string(),
            ));
        }
        if subscriptions.iter().any(|s| s.name().is_empty()) {
            return Err(ConnectorError::InvalidArgument(
                "topic names cannot be empty".to_string(),
            ));
        }

        let _subscribing = self.inner.subscriptions.lock();
        self.inner.ensure_open()?;
        self.inner.transport.subscribe(&subscriptions)?;

        let _guard = self.inner.registration.lock();
        self.inner.ensure_open()?;
        let id = self.inner.next_id();
        let callback: Arc<dyn Callback<Message>> = Arc::new(callback);
        self.inner
            .pubsub
            .insert(&subscriptions, id, callback, Arc::new(extra));
        self.inner.start_pubsub(mode)?;
        debug!(subscription = %id, count = subscriptions.len(), "registered pub/sub callback");
        Ok(id)
    }

    /// Register a callback for stream topics.
    ///
    /// Queued subscriptions share one listener and one dispatcher per
    /// connector. Newest-only subscriptions get a dedicated listener per
    /// topic that always serves the latest record and drops backlog.
    /// A topic is consumed in one mode at a time.
    pub fn register_stream<I, S, Cb>(
        &self,
        topics: I,
        callback: Cb,
        options: StreamOptions,
        extra: Extra,
    ) -> Result<SubscriptionId, ConnectorError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        Cb: Callback<StreamMessage> + 'static,
    {
        let topics: Vec<String> = topics
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if topics.is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "stream topics cannot be empty".to_string(),
            ));
        }
        if topics.iter().any(String::is_empty) {
            return Err(ConnectorError::InvalidArgument(
                "stream topic names cannot be empty".to_string(),
            ));
        }
        if options.newest_only && options.from_start {
            return Err(ConnectorError::InvalidArgument(
                "newest_only and from_start cannot both be set".to_string(),
            ));
        }

        self.inner.ensure_open()?;
        let starts = topics
            .iter()
            .map(|topic| self.inner.initial_cursor(topic, options.from_start))
            .collect::<Result<Vec<_>, _>>()?;

        let _guard = self.inner.registration.lock();
        self.inner.ensure_open()?;
        self.inner.check_stream_mode(&topics, options.newest_only)?;

        let id = self.inner.next_id();
        let callback: Arc<dyn Callback<StreamMessage>> = Arc::new(callback);
        let registration = Registration {
            id,
            callback,
            extra: Arc::new(extra),
        };
        if options.newest_only {
            self.inner
                .add_direct_listeners(&topics, registration, &starts)?;
        } else {
            self.inner.add_queued(&topics, registration, &starts);
            self.inner.start_streams(options.dispatch)?;
        }
        debug!(subscription = %id, newest_only = options.newest_only, "registered stream callback");
        Ok(id)
    }

    /// Remove a registration. `false` if the id is unknown.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        self.try_unregister(id).is_ok()
    }

    /// Remove a registration, failing with `NotFound` if the id is unknown.
    ///
    /// For newest-only subscriptions this stops and joins their listeners.
    pub fn try_unregister(&self, id: SubscriptionId) -> Result<(), ConnectorError> {
        let subscribing = self.inner.subscriptions.lock();
        let listeners = {
            let guard = self.inner.registration.lock();
            if let Some(emptied) = self.inner.pubsub.remove(id) {
                drop(guard);
                if !emptied.is_empty() {
                    if let Err(err) = self.inner.transport.unsubscribe(&emptied) {
                        warn!(subscription = %id, error = %err, "failed to unsubscribe");
                    }
                }
                debug!(subscription = %id, "unregistered pub/sub callback");
                return Ok(());
            }
            if let Some(emptied) = self.inner.streams.remove(id) {
                for topic in &emptied {
                    self.inner.cursors.remove(topic);
                }
                debug!(subscription = %id, "unregistered stream callback");
                return Ok(());
            }
            self.inner
                .remove_direct(id)
                .ok_or(ConnectorError::NotFound(id))?
        };
        drop(subscribing);
        direct::stop_all(listeners);
        debug!(subscription = %id, "unregistered newest-only stream callback");
        Ok(())
    }

    pub fn is_registered(&self, id: SubscriptionId) -> bool {
        self.inner.pubsub.contains(id)
            || self.inner.streams.contains(id)
            || self.inner.direct.lock().contains_key(&id)
    }

    /// Publish raw payload bytes on a topic.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), ConnectorError> {
        if topic.is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "topic cannot be empty".to_string(),
            ));
        }
        self.inner.ensure_open()?;
        self.inner.transport.publish(topic, payload)?;
        Ok(())
    }

    /// Encode a value with the connector's codec and publish it.
    pub fn send(&self, topic: &str, value: &Value) -> Result<(), ConnectorError> {
        let payload = self.inner.codec.encode(value)?;
        self.publish(topic, &payload)
    }

    /// Append a record to a stream. Each field value is encoded separately.
    pub fn append_to_stream(
        &self,
        topic: &str,
        fields: &Fields,
        options: AppendOptions,
    ) -> Result<StreamId, ConnectorError> {
        if topic.is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "stream topic cannot be empty".to_string(),
            ));
        }
        if options.max_len == Some(0) {
            return Err(ConnectorError::InvalidArgument(
                "max_len must be greater than zero".to_string(),
            ));
        }
        self.inner.ensure_open()?;
        let raw = self.inner.codec.encode_fields(fields)?;
        Ok(self.inner.transport.stream_append(topic, &raw, options)?)
    }

    /// The newest `count` records of a stream, oldest first.
    pub fn get_last(&self, topic: &str, count: usize) -> Result<Vec<StreamMessage>, ConnectorError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.inner.ensure_open()?;
        let records = self.inner.transport.stream_read_latest(topic, count)?;
        self.inner.decode_records(topic, records)
    }

    /// Records with `start <= id <= end`, oldest first.
    pub fn stream_range(
        &self,
        topic: &str,
        start: StreamId,
        end: StreamId,
        count: Option<usize>,
    ) -> Result<Vec<StreamMessage>, ConnectorError> {
        self.inner.ensure_open()?;
        let records = self.inner.transport.stream_range(topic, start, end, count)?;
        self.inner.decode_records(topic, records)
    }

    /// Id of the last record delivered on a stream topic.
    pub fn cursor(&self, topic: &str) -> Option<StreamId> {
        self.inner.cursors.delivered(topic)
    }

    /// Drain one pub/sub message by hand.
    ///
    /// Returns `Ok(true)` once a message has been dispatched, `Ok(false)`
    /// after shutdown, and `Err(Timeout)` if nothing arrived in time.
    pub fn poll_messages(&self, timeout: Option<Duration>) -> Result<bool, ConnectorError> {
        self.inner.poll_messages(timeout)
    }

    /// Drain one batch of queued stream records by hand. Same contract as
    /// [`poll_messages`](Self::poll_messages).
    pub fn poll_stream_messages(&self, timeout: Option<Duration>) -> Result<bool, ConnectorError> {
        self.inner.poll_stream_messages(timeout)
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop every background task and wait for each to exit.
    ///
    /// Listeners observe the stop flag after their current poll returns;
    /// dispatchers are unblocked by a stop sentinel. Idempotent.
    pub fn shutdown(&self) {
        let (mut workers, direct) = {
            let _guard = self.inner.registration.lock();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.inner.stop.set();
            (
                std::mem::take(&mut *self.inner.workers.lock()),
                std::mem::take(&mut *self.inner.direct.lock()),
            )
        };
        debug!(
            pending_messages = self.inner.pubsub_queue.len(),
            pending_batches = self.inner.stream_queue.len(),
            "shutting down connector"
        );

        for listener in direct.values().flatten() {
            listener.signal_stop();
        }
        for task in [Task::PubsubListener, Task::StreamListener] {
            if let Some(handle) = workers.slot(task).take() {
                join_worker(task.name(), handle);
            }
        }
        self.inner.pubsub_queue.stop();
        self.inner.stream_queue.stop();
        for task in [Task::PubsubDispatcher, Task::StreamDispatcher] {
            if let Some(handle) = workers.slot(task).take() {
                join_worker(task.name(), handle);
            }
        }
        direct::stop_all(direct.into_values().flatten().collect());
        debug!("connector shut down");
    }
}

impl<T: Transport, C: Codec> Drop for Connector<T, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Transport, C: Codec> Inner<T, C> {
    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_open(&self) -> Result<(), ConnectorError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ConnectorError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn report(&self, err: BackgroundError) {
        (self.sink)(&err);
    }

    /// Invoke one registration, isolating its errors and panics.
    pub(crate) fn invoke<M>(&self, topic: &str, registration: &Registration<M>, message: &M) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            registration.callback.call(message, &registration.extra)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(source)) => self.report(BackgroundError::Callback {
                topic: topic.to_string(),
                subscription: registration.id,
                source,
            }),
            Err(panic) => self.report(BackgroundError::CallbackPanicked {
                topic: topic.to_string(),
                subscription: registration.id,
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    fn decode_records(
        &self,
        topic: &str,
        records: Vec<crate::transport::StreamRecord>,
    ) -> Result<Vec<StreamMessage>, ConnectorError> {
        records
            .into_iter()
            .map(|record| {
                Ok(StreamMessage {
                    topic: topic.to_string(),
                    id: record.id,
                    fields: self.codec.decode_fields(&record.fields)?,
                })
            })
            .collect()
    }

    /// Cursor a new subscription starts from: the beginning, or the newest
    /// existing record so only records appended later are delivered.
    pub(crate) fn initial_cursor(&self, topic: &str, from_start: bool) -> Result<StreamId, ConnectorError> {
        if from_start {
            return Ok(StreamId::ZERO);
        }
        let latest = self.transport.stream_read_latest(topic, 1)?;
        Ok(latest.last().map_or(StreamId::ZERO, |record| record.id))
    }

    fn check_stream_mode(&self, topics: &[String], newest_only: bool) -> Result<(), ConnectorError> {
        let direct = self.direct.lock();
        for topic in topics {
            let queued = self.streams.contains_key(topic);
            let is_direct = direct.values().flatten().any(|l| l.topic() == topic);
            if (newest_only && queued) || (!newest_only && is_direct) {
                return Err(ConnectorError::InvalidArgument(format!(
                    "stream `{topic}` is already consumed in {} mode",
                    if queued { "queued" } else { "newest-only" }
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Task {
    PubsubListener,
    PubsubDispatcher,
    StreamListener,
    StreamDispatcher,
}

impl Task {
    fn name(self) -> &'static str {
        match self {
            Task::PubsubListener => "pubsub-listener",
            Task::PubsubDispatcher => "pubsub-dispatcher",
            Task::StreamListener => "stream-listener",
            Task::StreamDispatcher => "stream-dispatcher",
        }
    }
}

impl Workers {
    fn slot(&mut self, task: Task) -> &mut Option<JoinHandle<()>> {
        match task {
            Task::PubsubListener => &mut self.pubsub_listener,
            Task::PubsubDispatcher => &mut self.pubsub_dispatcher,
            Task::StreamListener => &mut self.stream_listener,
            Task::StreamDispatcher => &mut self.stream_dispatcher,
        }
    }
}

impl<T: Transport, C: Codec> Inner<T, C> {
    /// Spawn a singleton task unless it is already running.
    fn start_worker<F>(self: &Arc<Self>, task: Task, run: F) -> Result<(), ConnectorError>
    where
        F: FnOnce(Arc<Self>) + Send + 'static,
    {
        let mut workers = self.workers.lock();
        let slot = workers.slot(task);
        if slot.is_none() {
            let inner = Arc::clone(self);
            *slot = Some(spawn_worker(task.name(), move || run(inner))?);
        }
        Ok(())
    }

    fn start_pubsub(self: &Arc<Self>, mode: DispatchMode) -> Result<(), ConnectorError> {
        self.start_worker(Task::PubsubListener, pubsub::listen::<T, C>)?;
        if mode == DispatchMode::Background {
            self.start_worker(Task::PubsubDispatcher, |inner| {
                while let Ok(true) = inner.poll_messages(None) {}
            })?;
        }
        Ok(())
    }

    fn start_streams(self: &Arc<Self>, mode: DispatchMode) -> Result<(), ConnectorError> {
        self.start_worker(Task::StreamListener, stream::listen::<T, C>)?;
        if mode == DispatchMode::Background {
            self.start_worker(Task::StreamDispatcher, |inner| {
                while let Ok(true) = inner.poll_stream_messages(None) {}
            })?;
        }
        Ok(())
    }
}
