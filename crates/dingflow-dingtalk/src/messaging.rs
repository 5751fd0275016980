// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Robot message delivery and attachment download.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dingflow_config::model::AccountConfig;
use dingflow_core::DingflowError;
use dingflow_resilience::{RetryPolicy, retry};
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{DingTalkClient, Recipient};
use crate::token::TokenCache;

/// Account and recipient a reply goes to.
#[derive(Debug, Clone)]
pub struct Destination {
    pub account: Arc<AccountConfig>,
    pub recipient: Recipient,
}

/// Sends robot messages on behalf of configured accounts.
#[derive(Clone)]
pub struct Messenger {
    client: Arc<DingTalkClient>,
    tokens: Arc<TokenCache>,
    retry: RetryPolicy,
}

impl Messenger {
    pub fn new(client: Arc<DingTalkClient>, tokens: Arc<TokenCache>, retry: RetryPolicy) -> Self {
        Self {
            client,
            tokens,
            retry,
        }
    }

    pub fn client(&self) -> &Arc<DingTalkClient> {
        &self.client
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Current access token for `account`.
    pub async fn token(&self, account: &AccountConfig) -> Result<String, DingflowError> {
        self.tokens
            .get_token(&account.client_id, &account.client_secret)
            .await
    }

    /// Sends one robot message.
    ///
    /// Transient failures are retried with backoff; a rejected token is
    /// refreshed and the send retried once.
    pub async fn send(&self, dest: &Destination, msg_key: &str, msg_param: &Value) -> Result<(), DingflowError> {
        let account = &dest.account;
        let token = self.token(account).await?;
        let attempt = |token: String| async move {
            retry(&self.retry, || {
                self.client.send_robot_message(
                    &token,
                    account.robot_code(),
                    &dest.recipient,
                    msg_key,
                    msg_param,
                )
            })
            .await
        };

        match attempt(token).await {
            Err(e) if e.is_auth() => {
                debug!(account = %account.id, "send token rejected, refreshing once");
                let fresh = self
                    .tokens
                    .refresh(&account.client_id, &account.client_secret)
                    .await?;
                attempt(fresh.token).await
            }
            other => other,
        }
    }

    pub async fn send_text(&self, dest: &Destination, text: &str) -> Result<(), DingflowError> {
        self.send(dest, "sampleText", &json!({ "content": text })).await
    }

    pub async fn send_markdown(&self, dest: &Destination, title: &str, text: &str) -> Result<(), DingflowError> {
        self.send(dest, "sampleMarkdown", &json!({ "title": title, "text": text }))
            .await
    }

    /// Downloads a message attachment into `dir` and returns the local path.
    pub async fn download_attachment(
        &self,
        account: &AccountConfig,
        download_code: &str,
        dir: &Path,
        file_name: &str,
    ) -> Result<PathBuf, DingflowError> {
        let token = self.token(account).await?;
        let url = retry(&self.retry, || {
            self.client
                .download_url(&token, account.robot_code(), download_code)
        })
        .await?;
        let bytes = retry(&self.retry, || self.client.download_bytes(&url)).await?;

        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            DingflowError::Internal(format!("cannot create {}: {e}", dir.display()))
        })?;
        let path = dir.join(format!("{}_{}", Uuid::new_v4().simple(), sanitize_file_name(file_name)));
        tokio::fs::write(&path, &bytes).await.map_err(|e| {
            DingflowError::Internal(format!("cannot write {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), size = bytes.len(), "attachment downloaded");
        Ok(path)
    }
}

/// Keeps a file name safe to join onto a directory.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ');
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned.to_string()
    }
}
