// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time-windowed suppression of redelivered inbound messages.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;

/// How long a message id is remembered.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Expired entries are purged after this many insertions.
const PURGE_EVERY: usize = 100;

pub struct DedupStore {
    window: Duration,
    seen: DashMap<String, Instant>,
    inserts: AtomicUsize,
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupStore {
    pub fn new() -> Self {
        Self::with_window(DEDUP_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            seen: DashMap::new(),
            inserts: AtomicUsize::new(0),
        }
    }

    /// Whether `message_id` was seen within the window.
    pub fn is_duplicate(&self, message_id: &str) -> bool {
        self.seen
            .get(message_id)
            .is_some_and(|first_seen| first_seen.elapsed() < self.window)
    }

    /// Records `message_id` as seen now, unless already seen within the window.
    pub fn mark_seen(&self, message_id: &str) {
        self.check_and_mark(message_id);
    }

    /// Marks `message_id` and returns `true` if it was not already seen.
    ///
    /// The check and the insert happen under one shard lock, so two
    /// concurrent deliveries of the same id cannot both get `true`.
    pub fn check_and_mark(&self, message_id: &str) -> bool {
        let now = Instant::now();
        let fresh = match self.seen.entry(message_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < self.window {
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
        };

        if fresh && (self.inserts.fetch_add(1, Ordering::Relaxed) + 1).is_multiple_of(PURGE_EVERY) {
            self.purge();
        }
        fresh
    }

    /// Drops entries older than the window. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            debug!(removed, "expired dedup entries purged");
        }
        removed
    }

    /// Forgets every entry.
    pub fn clear(&self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
