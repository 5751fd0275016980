// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Active-card registry: at most one non-terminal card per conversation.
//!
//! Creation is single-flight per [`TargetKey`]: a per-target lock is held
//! across lookup and create, so two concurrent handlers for the same
//! conversation share one card instead of delivering two.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dingflow_config::model::AccountConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::card::{CardEngine, CardInstance, CardTarget, TargetKey};

/// Terminal cards are kept this long after their last update.
pub const CARD_RETENTION: Duration = Duration::from_secs(60 * 60);

/// A card shared between the cache and the handler driving it.
pub type SharedCard = Arc<Mutex<CardInstance>>;

pub struct CardCache {
    engine: Arc<CardEngine>,
    retention: Duration,
    instances: DashMap<String, SharedCard>,
    targets: DashMap<TargetKey, String>,
    create_locks: DashMap<TargetKey, Arc<Mutex<()>>>,
}

impl CardCache {
    pub fn new(engine: Arc<CardEngine>) -> Self {
        Self::with_retention(engine, CARD_RETENTION)
    }

    pub fn with_retention(engine: Arc<CardEngine>, retention: Duration) -> Self {
        Self {
            engine,
            retention,
            instances: DashMap::new(),
            targets: DashMap::new(),
            create_locks: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<CardEngine> {
        &self.engine
    }

    /// Returns the live card for `target`, creating one if none is active.
    ///
    /// `None` means creation failed and the caller should fall back to a
    /// plain reply.
    pub async fn get_or_create(&self, account: &Arc<AccountConfig>, target: &CardTarget) -> Option<SharedCard> {
        let key = target.key();
        let lock = self.create_locks.entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;

        if let Some(card) = self.active(&key).await {
            debug!(target = %key, "reusing active card");
            return Some(card);
        }

        let card = self.engine.create(account, target).await?;
        let id = card.out_track_id.clone();
        let shared = Arc::new(Mutex::new(card));
        self.instances.insert(id.clone(), Arc::clone(&shared));
        self.targets.insert(key, id);
        Some(shared)
    }

    /// The non-terminal card mapped to `key`, evicting a terminal mapping.
    pub async fn active(&self, key: &TargetKey) -> Option<SharedCard> {
        let id = self.targets.get(key).map(|e| e.value().clone())?;
        let Some(card) = self.instances.get(&id).map(|e| Arc::clone(e.value())) else {
            self.targets.remove(key);
            return None;
        };
        if card.lock().await.state.is_terminal() {
            self.targets.remove_if(key, |_, mapped| *mapped == id);
            return None;
        }
        Some(card)
    }

    /// Removes terminal cards whose last update is older than the retention
    /// window, plus any mappings and create locks left dangling. Returns the
    /// number of cards removed.
    ///
    /// Never waits: a card whose lock is held is being driven by a handler
    /// and is skipped until the next sweep.
    pub fn cleanup(&self) -> usize {
        let snapshot: Vec<(String, SharedCard)> = self
            .instances
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let now = Instant::now();
        let mut removed = 0;
        for (id, card) in snapshot {
            let expired = match card.try_lock() {
                Ok(card) => card.state.is_terminal() && now.duration_since(card.last_updated) >= self.retention,
                Err(_) => false,
            };
            if expired {
                self.instances.remove(&id);
                removed += 1;
            }
        }

        self.targets.retain(|_, id| self.instances.contains_key(id));
        self.create_locks
            .retain(|key, lock| Arc::strong_count(lock) > 1 || self.targets.contains_key(key));

        if removed > 0 {
            debug!(removed, remaining = self.instances.len(), "card cache swept");
        }
        removed
    }

    /// Number of cards held, terminal or not.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
