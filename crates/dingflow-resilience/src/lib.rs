// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilience primitives for Dingflow remote calls.

pub mod retry;

pub use retry::{RetryPolicy, retry, retry_if};
