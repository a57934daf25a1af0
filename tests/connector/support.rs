//! Shared fixtures for connector tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use busline::serde_json::Value;
use busline::transport::{InMemoryBus, InMemoryTransport};
use busline::{BackgroundError, Connector, ConnectorConfig, Fields};

/// Short intervals so background loops react quickly in tests.
pub fn fast_config() -> ConnectorConfig {
    ConnectorConfig {
        poll_timeout_ms: 20,
        reconnect_backoff_ms: 20,
        stream_block_ms: 50,
        direct_idle_ms: 5,
        stream_idle_ms: 5,
    }
}

pub fn connector(bus: &InMemoryBus) -> Connector<InMemoryTransport> {
    Connector::builder(bus.connect())
        .config(fast_config())
        .build()
        .unwrap()
}

/// A connector whose background errors are collected instead of logged.
pub fn connector_with_errors(bus: &InMemoryBus) -> (Connector<InMemoryTransport>, Recorder<String>) {
    let errors = Recorder::new();
    let sink = errors.clone();
    let connector = Connector::builder(bus.connect())
        .config(fast_config())
        .error_sink(move |err: &BackgroundError| {
            let kind = match err {
                BackgroundError::Transport { .. } => "transport",
                BackgroundError::Decode { .. } => "decode",
                BackgroundError::Callback { .. } => "callback",
                BackgroundError::CallbackPanicked { .. } => "panic",
            };
            sink.push(kind.to_string());
        })
        .build()
        .unwrap();
    (connector, errors)
}

/// Thread-safe list of everything a callback saw.
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    /// Wait until at least `n` items were recorded.
    pub fn wait_for(&self, n: usize) -> bool {
        wait_until(Duration::from_secs(2), || self.len() >= n)
    }
}

impl<T: Clone + PartialEq> Recorder<T> {
    pub fn count(&self, item: &T) -> usize {
        self.items.lock().unwrap().iter().filter(|i| *i == item).count()
    }
}

pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Give background tasks time to (wrongly) deliver something.
pub fn settle() {
    thread::sleep(Duration::from_millis(150));
}

pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Fields {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
