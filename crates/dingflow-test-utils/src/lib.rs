// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Dingflow integration tests.
//!
//! Provides mock adapters and fixtures for fast, deterministic,
//! CI-runnable tests without external services.
//!
//! # Components
//!
//! - [`MockProvider`] - Mock completion provider replaying scripted fragments
//! - [`MockChannel`] - Mock transport with message injection and delivery capture
//! - [`fixtures`] - Inbound message and account builders

pub mod fixtures;
pub mod mock_channel;
pub mod mock_provider;

pub use mock_channel::MockChannel;
pub use mock_provider::{MockProvider, Script};
