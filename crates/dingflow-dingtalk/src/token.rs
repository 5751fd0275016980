// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Access-token cache keyed by client id.
//!
//! Concurrent misses for the same client are not coalesced; both callers
//! fetch and the later write wins. Token issuance is idempotent per client,
//! so the duplicate fetch is harmless.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dingflow_core::DingflowError;
use dingflow_resilience::{RetryPolicy, retry};
use tokio::time::Instant;
use tracing::debug;

use crate::client::DingTalkClient;

/// Tokens are treated as expired this long before their real expiry.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    issued_at: Instant,
    expires_at: Instant,
}

/// A token handed out by the cache, with the instant it was issued.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub issued_at: Instant,
}

/// Process-wide access-token store.
pub struct TokenCache {
    client: Arc<DingTalkClient>,
    retry: RetryPolicy,
    entries: DashMap<String, CachedToken>,
}

impl TokenCache {
    pub fn new(client: Arc<DingTalkClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            entries: DashMap::new(),
        }
    }

    /// Returns a token valid for at least [`EXPIRY_MARGIN`], fetching one if needed.
    pub async fn get(&self, client_id: &str, client_secret: &str) -> Result<Credential, DingflowError> {
        if let Some(entry) = self.entries.get(client_id)
            && Instant::now() + EXPIRY_MARGIN < entry.expires_at
        {
            return Ok(Credential {
                token: entry.token.clone(),
                issued_at: entry.issued_at,
            });
        }
        self.refresh(client_id, client_secret).await
    }

    /// Convenience wrapper returning only the token string.
    pub async fn get_token(&self, client_id: &str, client_secret: &str) -> Result<String, DingflowError> {
        self.get(client_id, client_secret).await.map(|c| c.token)
    }

    /// Fetches a new token regardless of what is cached.
    pub async fn refresh(&self, client_id: &str, client_secret: &str) -> Result<Credential, DingflowError> {
        let issued = retry(&self.retry, || {
            self.client.fetch_access_token(client_id, client_secret)
        })
        .await?;

        let now = Instant::now();
        let cached = CachedToken {
            token: issued.token,
            issued_at: now,
            expires_at: now + issued.expires_in,
        };
        debug!(client_id, expires_in_secs = issued.expires_in.as_secs(), "access token issued");
        let credential = Credential {
            token: cached.token.clone(),
            issued_at: now,
        };
        self.entries.insert(client_id.to_string(), cached);
        Ok(credential)
    }

    /// Drops the cached token for a client.
    pub fn invalidate(&self, client_id: &str) {
        self.entries.remove(client_id);
    }
}
