// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock channel adapter for deterministic testing.
//!
//! `MockChannel` implements `ChannelAdapter` with injectable inbound messages
//! and records which message ids were handed out, standing in for the
//! transport's acknowledgements.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use dingflow_core::DingflowError;
use dingflow_core::traits::ChannelAdapter;
use dingflow_core::types::{HealthStatus, InboundMessage};

/// A mock transport for one account.
///
/// Clones share the same queues, so a test can keep a handle after moving
/// the channel into a bridge loop.
#[derive(Clone)]
pub struct MockChannel {
    account_id: String,
    inbound: Arc<Mutex<VecDeque<InboundMessage>>>,
    acknowledged: Arc<Mutex<Vec<String>>>,
    notify: Arc<Notify>,
    connected: Arc<AtomicBool>,
    shut_down: Arc<AtomicBool>,
}

impl MockChannel {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            inbound: Arc::new(Mutex::new(VecDeque::new())),
            acknowledged: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
            connected: Arc::new(AtomicBool::new(false)),
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Inject an inbound message into the receive queue.
    pub async fn inject_message(&self, msg: InboundMessage) {
        self.inbound.lock().await.push_back(msg);
        self.notify.notify_one();
    }

    /// Ids of every message handed to the consumer, in delivery order.
    pub async fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.lock().await.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelAdapter for MockChannel {
    fn name(&self) -> &str {
        "mock-channel"
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn connect(&mut self) -> Result<(), DingflowError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&self) -> Result<InboundMessage, DingflowError> {
        loop {
            {
                let mut queue = self.inbound.lock().await;
                if let Some(msg) = queue.pop_front() {
                    self.acknowledged
                        .lock()
                        .await
                        .push(msg.message_id.0.clone());
                    return Ok(msg);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn health_check(&self) -> Result<HealthStatus, DingflowError> {
        if self.is_connected() && !self.is_shut_down() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy("not connected".into()))
        }
    }

    async fn shutdown(&self) -> Result<(), DingflowError> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::text_message;

    #[tokio::test]
    async fn injected_messages_are_received_in_order() {
        let channel = MockChannel::new("default");
        channel.inject_message(text_message("m1", "u1", "first")).await;
        channel.inject_message(text_message("m2", "u1", "second")).await;

        assert_eq!(channel.receive().await.unwrap().message_id.0, "m1");
        assert_eq!(channel.receive().await.unwrap().message_id.0, "m2");
        assert_eq!(channel.acknowledged().await, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn receive_waits_for_injection() {
        let channel = MockChannel::new("default");
        let handle = channel.clone();
        let waiter = tokio::spawn(async move { handle.receive().await });

        tokio::task::yield_now().await;
        channel.inject_message(text_message("late", "u1", "hi")).await;

        let msg = waiter.await.unwrap().unwrap();
        assert_eq!(msg.message_id.0, "late");
    }

    #[tokio::test]
    async fn health_follows_connection_state() {
        let mut channel = MockChannel::new("default");
        assert!(matches!(channel.health_check().await.unwrap(), HealthStatus::Unhealthy(_)));
        channel.connect().await.unwrap();
        assert_eq!(channel.health_check().await.unwrap(), HealthStatus::Healthy);
        channel.shutdown().await.unwrap();
        assert!(channel.is_shut_down());
    }
}
