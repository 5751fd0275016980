// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! DingTalk provider integration for the Dingflow bridge.
//!
//! - [`client`]: REST calls against the open platform.
//! - [`token`]: access-token cache.
//! - [`card`] and [`card_cache`]: AI card lifecycle and the per-conversation
//!   active-card registry.
//! - [`markers`] and [`media`]: media markers in generated text and the
//!   post-processing pipeline that uploads and delivers them.
//! - [`messaging`]: robot message send and attachment download.
//! - [`inbound`] and [`stream`]: callback decoding and the stream-mode
//!   WebSocket transport.

pub mod card;
pub mod card_cache;
pub mod client;
pub mod inbound;
pub mod markers;
pub mod media;
pub mod messaging;
pub mod stream;
pub mod token;

pub use card::{CardEngine, CardInstance, CardTarget, FlowStatus, TargetKey};
pub use card_cache::{CardCache, SharedCard};
pub use client::{DingTalkClient, Recipient};
pub use media::{MediaOutcome, MediaPipeline, ProcessedReply};
pub use messaging::{Destination, Messenger};
pub use stream::DingTalkStreamClient;
pub use token::TokenCache;
