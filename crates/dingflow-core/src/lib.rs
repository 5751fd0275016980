// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Dingflow bridge.
//!
//! Provides the error type, the canonical inbound message shape and the
//! adapter traits shared by the transport, backend and handler crates.

pub mod error;
pub mod traits;
pub mod types;

pub use error::DingflowError;
pub use types::{ConversationKind, HealthStatus, InboundMessage, MessageBody, MessageId};

pub use traits::{ChannelAdapter, CompletionProvider};
