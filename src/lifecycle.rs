//! Background task plumbing: stop signals, dispatch queues, spawn/join.

use std::any::Any;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::ConnectorError;

/// A one-shot stop flag that sleeping loops can wait on.
#[derive(Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep up to `timeout`, returning early (with `true`) once stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// Tracks connectivity of one listener so failures are logged once per
/// connected -> disconnected transition instead of once per retry.
pub(crate) struct LinkState {
    task: &'static str,
    down: bool,
}

impl LinkState {
    pub fn new(task: &'static str) -> Self {
        Self { task, down: false }
    }

    pub fn up(&mut self) {
        if self.down {
            self.down = false;
            info!(task = self.task, "message bus connection restored");
        }
    }

    pub fn down(&mut self, err: &dyn std::error::Error) {
        if !self.down {
            self.down = true;
            error!(task = self.task, error = %err, "failed to reach the message bus, retrying");
        }
    }
}

/// Item of a dispatch queue: a payload or the stop sentinel.
pub(crate) enum Dispatch<T> {
    Item(T),
    Stop,
}

/// Unbounded FIFO between a listener and its dispatcher.
pub(crate) struct DispatchQueue<T> {
    tx: Sender<Dispatch<T>>,
    rx: Receiver<Dispatch<T>>,
}

impl<T> DispatchQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        // Both ends live in `self`, so the channel never disconnects.
        let _ = self.tx.send(Dispatch::Item(item));
    }

    /// Enqueue the stop sentinel.
    pub fn stop(&self) {
        let _ = self.tx.send(Dispatch::Stop);
    }

    /// Pop the next item, blocking up to `timeout` (forever with `None`).
    ///
    /// The stop sentinel is put back before being returned, so every consumer
    /// of the queue observes it.
    pub fn pop(&self, timeout: Option<Duration>) -> Result<Dispatch<T>, ConnectorError> {
        let next = match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => ConnectorError::Timeout(timeout),
                RecvTimeoutError::Disconnected => ConnectorError::Closed,
            })?,
            None => self.rx.recv().map_err(|_| ConnectorError::Closed)?,
        };
        if let Dispatch::Stop = next {
            self.stop();
        }
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

pub(crate) fn spawn_worker<F>(task: &'static str, f: F) -> Result<JoinHandle<()>, ConnectorError>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("busline-{task}"))
        .spawn(move || {
            debug!(task, "background task started");
            f();
            debug!(task, "background task stopped");
        })
        .map_err(|source| ConnectorError::Spawn { task, source })?;
    Ok(handle)
}

/// Join a background task. A task never joins itself: when shutdown is
/// triggered from inside a callback the current thread just returns and the
/// loop exits on its own.
pub(crate) fn join_worker(task: &str, handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if let Err(panic) = handle.join() {
        warn!(task, reason = %panic_message(panic.as_ref()), "background task panicked");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
