// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-sender conversation continuity.
//!
//! A sender keeps the same session key while messages keep arriving within
//! the timeout. A timeout or an explicit reset mints a new key
//! `scope:sender:epoch_ms`. Epochs are strictly increasing across the
//! process, so a new key never repeats an earlier one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, info};

/// Commands that start a new session. Matched exactly after trimming and
/// lower-casing.
pub const NEW_SESSION_COMMANDS: &[&str] = &["/new", "/reset", "/clear", "新会话", "重新开始", "清空对话"];

/// Whether `text` is a new-session command.
pub fn is_new_session_command(text: &str) -> bool {
    let folded = text.trim().to_lowercase();
    NEW_SESSION_COMMANDS.contains(&folded.as_str())
}

/// Why a resolution produced the key it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollover {
    /// Existing session continued.
    Continued,
    /// First message from this sender.
    Started,
    /// Previous session expired.
    TimedOut,
    /// Reset requested.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub session_key: String,
    pub rollover: Rollover,
}

impl Resolution {
    /// Whether a new key was minted.
    pub fn is_new(&self) -> bool {
        self.rollover != Rollover::Continued
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    key: String,
    last_active: Instant,
}

/// Process-wide session map.
pub struct SessionStore {
    scope: String,
    records: DashMap<String, SessionRecord>,
    last_epoch_ms: AtomicI64,
}

impl SessionStore {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            records: DashMap::new(),
            last_epoch_ms: AtomicI64::new(0),
        }
    }

    /// Returns the session key for `sender`, minting a new one when forced,
    /// when none exists or when the last activity is older than `timeout`.
    pub fn resolve(&self, sender: &str, force_new: bool, timeout: Duration) -> Resolution {
        let now = Instant::now();
        let mut entry = self.records.entry(sender.to_string());

        let rollover = match &mut entry {
            Entry::Occupied(_) if force_new => Rollover::Forced,
            Entry::Occupied(occupied) => {
                let record = occupied.get_mut();
                if now.duration_since(record.last_active) > timeout {
                    Rollover::TimedOut
                } else {
                    record.last_active = now;
                    return Resolution {
                        session_key: record.key.clone(),
                        rollover: Rollover::Continued,
                    };
                }
            }
            Entry::Vacant(_) if force_new => Rollover::Forced,
            Entry::Vacant(_) => Rollover::Started,
        };

        let key = format!("{}:{sender}:{}", self.scope, self.next_epoch_ms());
        let record = SessionRecord {
            key: key.clone(),
            last_active: now,
        };
        entry.insert(record);

        match rollover {
            Rollover::TimedOut => info!(sender, session_key = %key, "session timed out, starting new one"),
            Rollover::Forced => info!(sender, session_key = %key, "session reset on request"),
            _ => debug!(sender, session_key = %key, "session started"),
        }
        Resolution {
            session_key: key,
            rollover,
        }
    }

    /// Drops sessions idle for longer than `max_age`. Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, record| now.duration_since(record.last_active) <= max_age);
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "idle sessions swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn next_epoch_ms(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        let mut last = self.last_epoch_ms.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match self
                .last_epoch_ms
                .compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1800);

    #[test]
    fn command_vocabulary_is_exact() {
        assert!(is_new_session_command("/new"));
        assert!(is_new_session_command("  /RESET "));
        assert!(is_new_session_command("新会话"));
        assert!(!is_new_session_command("/new please"));
        assert!(!is_new_session_command("/ne"));
        assert!(!is_new_session_command(""));
    }

    #[tokio::test(start_paused = true)]
    async fn key_is_stable_within_timeout() {
        let store = SessionStore::new("dingtalk");
        let first = store.resolve("u1", false, TIMEOUT);
        assert_eq!(first.rollover, Rollover::Started);
        assert!(first.session_key.starts_with("dingtalk:u1:"));

        tokio::time::advance(Duration::from_secs(1700)).await;
        let second = store.resolve("u1", false, TIMEOUT);
        assert_eq!(second.rollover, Rollover::Continued);
        assert_eq!(second.session_key, first.session_key);

        // Activity refreshed the timestamp, so another 1700 s is still inside.
        tokio::time::advance(Duration::from_secs(1700)).await;
        assert_eq!(store.resolve("u1", false, TIMEOUT).session_key, first.session_key);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_mints_a_new_key() {
        let store = SessionStore::new("dingtalk");
        let first = store.resolve("u1", false, TIMEOUT);
        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        let second = store.resolve("u1", false, TIMEOUT);
        assert_eq!(second.rollover, Rollover::TimedOut);
        assert_ne!(second.session_key, first.session_key);
    }

    #[test]
    fn forced_resets_never_repeat_keys() {
        let store = SessionStore::new("dingtalk");
        let mut keys = std::collections::HashSet::new();
        keys.insert(store.resolve("u1", false, TIMEOUT).session_key);
        for _ in 0..50 {
            let r = store.resolve("u1", true, TIMEOUT);
            assert_eq!(r.rollover, Rollover::Forced);
            assert!(keys.insert(r.session_key));
        }
    }

    #[test]
    fn senders_are_independent() {
        let store = SessionStore::new("dingtalk");
        let a = store.resolve("a", false, TIMEOUT);
        let b = store.resolve("b", false, TIMEOUT);
        assert_ne!(a.session_key, b.session_key);
        store.resolve("a", true, TIMEOUT);
        assert_eq!(store.resolve("b", false, TIMEOUT).session_key, b.session_key);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_idle_sessions() {
        let store = SessionStore::new("dingtalk");
        store.resolve("old", false, TIMEOUT);
        tokio::time::advance(Duration::from_secs(100)).await;
        store.resolve("fresh", false, TIMEOUT);
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(store.sweep(Duration::from_secs(120)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve("fresh", false, TIMEOUT).rollover, Rollover::Continued);
    }
}
