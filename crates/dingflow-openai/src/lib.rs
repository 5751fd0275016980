// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OpenAI-compatible completion backend for the Dingflow bridge.
//!
//! Implements [`CompletionProvider`] over a streaming `/v1/chat/completions`
//! endpoint that answers with `data: <json>` lines and a `data: [DONE]` sentinel.

pub mod client;
pub mod sse;
pub mod types;

use async_trait::async_trait;
use dingflow_config::model::GatewayConfig;
use dingflow_core::DingflowError;
use dingflow_core::traits::CompletionProvider;
use dingflow_core::types::{CompletionRequest, TextStream};
use tracing::info;

pub use client::GatewayClient;

/// Completion provider backed by [`GatewayClient`].
pub struct GatewayProvider {
    client: GatewayClient,
}

impl GatewayProvider {
    pub fn new(config: &GatewayConfig) -> Result<Self, DingflowError> {
        let client = GatewayClient::new(config)?;
        info!(endpoint = client.endpoint(), model = %config.model, "completion gateway configured");
        Ok(Self { client })
    }
}

#[async_trait]
impl CompletionProvider for GatewayProvider {
    fn name(&self) -> &str {
        "openai-gateway"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, DingflowError> {
        self.client.stream_chat(&request).await
    }
}
