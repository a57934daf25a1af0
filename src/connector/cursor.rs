//! Per-topic stream cursors.
//!
//! Each entry tracks two positions. `delivered` is the id of the last record
//! handed to callbacks and only the dispatcher moves it. `fetched` is the id
//! of the last record the listener has queued; the listener reads from there
//! so a record waiting in the dispatch queue is not read twice.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::transport::StreamId;

#[derive(Debug, Clone, Copy)]
struct Cursor {
    delivered: StreamId,
    fetched: StreamId,
}

pub(crate) struct CursorTable {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl CursorTable {
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Create the entry for `topic` at `start` unless one already exists.
    /// Returns the delivered position in effect.
    pub fn seed(&self, topic: &str, start: StreamId) -> StreamId {
        self.cursors
            .lock()
            .entry(topic.to_string())
            .or_insert(Cursor {
                delivered: start,
                fetched: start,
            })
            .delivered
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.cursors.lock().contains_key(topic)
    }

    pub fn delivered(&self, topic: &str) -> Option<StreamId> {
        self.cursors.lock().get(topic).map(|c| c.delivered)
    }

    /// Move the delivered position forward. Never moves backwards.
    pub fn advance(&self, topic: &str, id: StreamId) {
        if let Some(cursor) = self.cursors.lock().get_mut(topic) {
            cursor.delivered = cursor.delivered.max(id);
            cursor.fetched = cursor.fetched.max(id);
        }
    }

    /// Advance the delivered position to `id` if the topic is still tracked
    /// and `id` is newer than anything delivered. Returns false for records
    /// that must not be handed out: stale reads queued before the cursor was
    /// reseeded, duplicates, or topics no longer consumed.
    pub fn claim(&self, topic: &str, id: StreamId) -> bool {
        let mut cursors = self.cursors.lock();
        match cursors.get_mut(topic) {
            Some(cursor) if id > cursor.delivered => {
                cursor.delivered = id;
                cursor.fetched = cursor.fetched.max(id);
                true
            }
            _ => false,
        }
    }

    /// Record that everything up to `id` has been queued for dispatch.
    pub fn mark_fetched(&self, topic: &str, id: StreamId) {
        if let Some(cursor) = self.cursors.lock().get_mut(topic) {
            cursor.fetched = cursor.fetched.max(id);
        }
    }

    /// Read positions for the given topics, skipping unknown ones.
    pub fn read_positions<'a, I>(&self, topics: I) -> BTreeMap<String, StreamId>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let cursors = self.cursors.lock();
        topics
            .into_iter()
            .filter_map(|topic| cursors.get(topic).map(|c| (topic.clone(), c.fetched)))
            .collect()
    }

    pub fn remove(&self, topic: &str) {
        self.cursors.lock().remove(topic);
    }
}
