// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded exponential-backoff retry.
//!
//! The delay before retry `n` (0-based) is `min(base * 2^n + jitter, max)`,
//! with jitter drawn uniformly from `[0, base)`. After the last attempt the
//! last error is returned unchanged.

use std::future::Future;
use std::time::Duration;

use dingflow_config::model::RetryConfig;
use dingflow_core::DingflowError;
use rand::Rng;
use tracing::warn;

/// Retry limits for one class of remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retrying after failed attempt `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
        };
        (self.backoff(attempt) + jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

/// Runs `operation`, retrying transient failures ([`DingflowError::is_transient`]).
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, DingflowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DingflowError>>,
{
    retry_if(policy, DingflowError::is_transient, operation).await
}

/// Runs `operation`, retrying every failure for which `should_retry` holds.
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> Result<T, DingflowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DingflowError>>,
    P: Fn(&DingflowError) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts && should_retry(&err) => {
                let delay = policy.delay_with_jitter(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "remote call failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
