//! Drops webhook redeliveries by message id.

use std::time::{Duration, Instant};

use dashmap::{DashMap, mapref::entry::Entry};

/// Remembers message ids for a fixed window.
pub struct MessageDeduper {
    window: Duration,
    seen: DashMap<String, Instant>,
}

impl MessageDeduper {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
        }
    }

    /// Record `message_id`. Returns `false` if it was already seen inside the window.
    pub fn first_sighting(&self, message_id: &str) -> bool {
        self.first_sighting_at(message_id, Instant::now())
    }

    pub fn first_sighting_at(&self, message_id: &str, now: Instant) -> bool {
        match self.seen.entry(message_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now.saturating_duration_since(*occupied.get()) < self.window {
                    false
                } else {
                    occupied.insert(now);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    /// Forget ids older than the window. Returns how many were dropped.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < self.window);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
