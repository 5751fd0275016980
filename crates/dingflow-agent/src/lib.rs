// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bridge loop and conversation state for the Dingflow bridge.
//!
//! The [`BridgeLoop`] is the central coordinator that:
//! - Receives messages from every account's channel adapter
//! - Spawns one [`MessageHandler`] task per message
//! - Runs the periodic cache sweep
//! - Stops on cancellation after a final sweep

pub mod dedup;
pub mod handler;
pub mod prompt;
pub mod session;
pub mod shutdown;

use std::sync::Arc;
use std::time::Duration;

use dingflow_core::{ChannelAdapter, DingflowError};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use dedup::DedupStore;
pub use handler::{HandleOutcome, HandlerSettings, MessageHandler, SweepReport};
pub use session::SessionStore;

/// Connects channels to the message handler.
pub struct BridgeLoop {
    channels: Vec<Box<dyn ChannelAdapter>>,
    handler: Arc<MessageHandler>,
    cleanup_interval: Duration,
}

impl BridgeLoop {
    pub fn new(handler: Arc<MessageHandler>, cleanup_interval: Duration) -> Self {
        Self {
            channels: Vec::new(),
            handler,
            cleanup_interval,
        }
    }

    pub fn add_channel(&mut self, channel: Box<dyn ChannelAdapter>) {
        self.channels.push(channel);
    }

    /// Runs until `cancel` fires.
    ///
    /// Handling tasks still in flight at that point are abandoned.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), DingflowError> {
        for channel in &mut self.channels {
            channel.connect().await?;
            info!(channel = channel.name(), account_id = channel.account_id(), "channel connected");
        }

        let mut receivers = JoinSet::new();
        for channel in self.channels {
            let channel: Arc<dyn ChannelAdapter> = Arc::from(channel);
            receivers.spawn(receive_loop(channel, Arc::clone(&self.handler), cancel.clone()));
        }
        info!("bridge loop running");

        let mut ticker = tokio::time::interval(self.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.handler.sweep();
                }
                _ = cancel.cancelled() => {
                    info!("shutdown signal received, stopping bridge loop");
                    break;
                }
            }
        }

        while let Some(joined) = receivers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "receive task ended abnormally");
            }
        }

        let report = self.handler.shutdown_sweep();
        info!(
            cards = report.cards,
            sessions = report.sessions,
            dedup = report.dedup,
            "bridge loop stopped"
        );
        Ok(())
    }
}

async fn receive_loop(channel: Arc<dyn ChannelAdapter>, handler: Arc<MessageHandler>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            msg = channel.receive() => {
                match msg {
                    Ok(inbound) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let msg_id = inbound.message_id.0.clone();
                            match handler.handle(inbound).await {
                                Ok(outcome) => debug!(msg_id = %msg_id, ?outcome, "message handled"),
                                Err(e) => error!(msg_id = %msg_id, error = %e, "failed to handle inbound message"),
                            }
                        });
                    }
                    Err(e) => {
                        error!(account_id = channel.account_id(), error = %e, "channel receive error");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    if let Err(e) = channel.shutdown().await {
        warn!(account_id = channel.account_id(), error = %e, "channel shutdown failed");
    }
}
