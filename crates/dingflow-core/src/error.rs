// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Dingflow bridge.

use std::time::Duration;

use thiserror::Error;

/// The primary error type used across all Dingflow crates.
#[derive(Debug, Error)]
pub enum DingflowError {
    /// Configuration errors (missing credentials, invalid values). Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The provider rejected the bearer credential (expired or revoked).
    #[error("authorization failed: {message}")]
    Auth { message: String },

    /// A remote call failed at the transport level or with a non-success status.
    #[error("remote call failed: {message}")]
    Remote {
        /// HTTP status, if a response was received at all.
        status: Option<u16>,
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The completion backend answered the initial request with a non-2xx status.
    #[error("completion backend returned {status}: {body}")]
    Completion { status: u16, body: String },

    /// Local validation failures (malformed marker payloads, missing or oversized artifacts).
    #[error("validation error: {0}")]
    Validation(String),

    /// Inbound transport errors (connection failure, closed channel, bad frames).
    #[error("channel error: {message}")]
    Channel {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DingflowError {
    /// Builds a [`DingflowError::Remote`] without an underlying source.
    pub fn remote(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: message.into(),
            source: None,
        }
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// Transport failures, timeouts, HTTP 429 and 5xx are transient.
    /// Authorization, configuration and validation failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote { status: None, .. } => true,
            Self::Remote {
                status: Some(code), ..
            }
            | Self::Completion { status: code, .. } => *code == 429 || *code >= 500,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Whether this error is an authorization failure that a credential refresh may fix.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}
