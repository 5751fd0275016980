// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapter trait definitions.
//!
//! Both traits use `#[async_trait]` for dynamic dispatch compatibility.

pub mod channel;
pub mod provider;

pub use channel::ChannelAdapter;
pub use provider::CompletionProvider;
