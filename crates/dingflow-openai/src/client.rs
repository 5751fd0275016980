// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP client for an OpenAI-compatible chat-completion gateway.
//!
//! Provides [`GatewayClient`], which opens one streaming request per user
//! turn and hands back the decoded text fragments.

use std::time::Duration;

use dingflow_config::model::GatewayConfig;
use dingflow_core::DingflowError;
use dingflow_core::types::{CompletionRequest, TextStream};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::{debug, warn};

use crate::sse;
use crate::types::ChatCompletionRequest;

/// Path appended to the configured base URL.
const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Connect timeout for the completion request; the body may stream far longer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streaming chat-completion client.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl GatewayClient {
    /// Creates a client from the gateway configuration.
    pub fn new(config: &GatewayConfig) -> Result<Self, DingflowError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = config.auth_token.as_deref().filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                DingflowError::Config(format!("invalid gateway.auth_token header value: {e}"))
            })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DingflowError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}{COMPLETIONS_PATH}",
                config.base_url.trim_end_matches('/')
            ),
            model: config.model.clone(),
        })
    }

    /// Returns the full completion endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Opens a streamed completion.
    ///
    /// Fails with [`DingflowError::Completion`] carrying the status and body
    /// when the backend answers with a non-2xx status.
    pub async fn stream_chat(&self, request: &CompletionRequest) -> Result<TextStream, DingflowError> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages(),
            stream: true,
            user: request.session_key.clone(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| DingflowError::Remote {
                status: None,
                message: format!("completion request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        debug!(status = %status, session_key = %request.session_key, "completion stream opened");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "completion backend rejected request");
            return Err(DingflowError::Completion {
                status: status.as_u16(),
                body,
            });
        }

        Ok(sse::decode_byte_stream(response.bytes_stream()))
    }
}
