//! Bounded in-memory log of sweep and probe events for diagnostics views.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of entries kept.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// FIFO ring of human-readable messages; the oldest entries fall off once
/// the capacity is exceeded. Safe to share between probe workers.
pub struct ActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn append(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "onionwatch::activity", "{}", message);

        let mut entries = self.entries.lock();
        entries.push_back(ActivityEntry {
            timestamp: Utc::now(),
            message,
        });
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Point-in-time copy, oldest first.
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
