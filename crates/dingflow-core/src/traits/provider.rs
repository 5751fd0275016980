// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion provider trait for the AI backend.

use async_trait::async_trait;

use crate::error::DingflowError;
use crate::types::{CompletionRequest, TextStream};

/// Adapter for a streaming chat-completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync + 'static {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Opens a streamed completion and returns its text fragments.
    ///
    /// A non-2xx initial response fails here with [`DingflowError::Completion`];
    /// errors after the stream is open surface as stream items.
    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, DingflowError>;
}
