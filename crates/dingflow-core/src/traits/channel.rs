// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channel adapter trait for the inbound message transport.

use async_trait::async_trait;

use crate::error::DingflowError;
use crate::types::{HealthStatus, InboundMessage};

/// Adapter for an inbound messaging transport.
///
/// Implementations acknowledge every delivery themselves, before the message
/// is handed to [`receive`](ChannelAdapter::receive) callers, so acknowledgement
/// never waits on handling.
#[async_trait]
pub trait ChannelAdapter: Send + Sync + 'static {
    /// Human-readable adapter name.
    fn name(&self) -> &str;

    /// The account this transport delivers messages for.
    fn account_id(&self) -> &str;

    /// Establishes the connection and starts delivering messages.
    async fn connect(&mut self) -> Result<(), DingflowError>;

    /// Receives the next decoded inbound message.
    async fn receive(&self) -> Result<InboundMessage, DingflowError>;

    /// Reports whether the transport is currently connected.
    async fn health_check(&self) -> Result<HealthStatus, DingflowError>;

    /// Stops delivering messages and releases the connection.
    async fn shutdown(&self) -> Result<(), DingflowError>;
}
