// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Mock completion provider for deterministic testing.
//!
//! `MockProvider` implements `CompletionProvider` with scripted fragment
//! sequences, so handler tests run without a completion backend.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::Mutex;

use dingflow_core::DingflowError;
use dingflow_core::traits::CompletionProvider;
use dingflow_core::types::{CompletionRequest, TextStream};

/// One scripted reply.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Fragments yielded in order.
    pub fragments: Vec<String>,
    /// Error yielded after the fragments, if any.
    pub fail_with: Option<String>,
    /// Fail before the stream opens, as a non-2xx response would.
    pub reject_status: Option<u16>,
}

impl Script {
    pub fn fragments<S: Into<String>>(fragments: impl IntoIterator<Item = S>) -> Self {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Yields the fragments, then an error item.
    pub fn interrupted<S: Into<String>>(
        fragments: impl IntoIterator<Item = S>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::fragments(fragments)
        }
    }

    /// Fails the request itself with `status`.
    pub fn rejected(status: u16) -> Self {
        Self {
            reject_status: Some(status),
            ..Default::default()
        }
    }
}

/// A mock completion provider that replays scripted replies.
///
/// Scripts are popped from a FIFO queue. When the queue is empty,
/// a single "mock response" fragment is returned.
pub struct MockProvider {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    fragment_delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            fragment_delay: None,
        }
    }

    /// Create a mock provider pre-loaded with the given scripts.
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(VecDeque::from(scripts))),
            ..Self::new()
        }
    }

    /// Sleeps before every fragment.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    /// Add a script to the end of the queue.
    pub async fn push_script(&self, script: Script) {
        self.scripts.lock().await.push_back(script);
    }

    /// Every request received so far.
    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    /// Number of `stream` calls received.
    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    async fn next_script(&self) -> Script {
        self.scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Script::fragments(["mock response"]))
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock-provider"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<TextStream, DingflowError> {
        self.requests.lock().await.push(request);
        let script = self.next_script().await;

        if let Some(status) = script.reject_status {
            return Err(DingflowError::Completion {
                status,
                body: "mock rejection".into(),
            });
        }

        let mut items: Vec<Result<String, DingflowError>> =
            script.fragments.into_iter().map(Ok).collect();
        if let Some(message) = script.fail_with {
            items.push(Err(DingflowError::Remote {
                status: None,
                message,
                source: None,
            }));
        }

        let delay = self.fragment_delay;
        let stream = stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            user_content: text.into(),
            system_instructions: vec![],
            session_key: "dingtalk:u1:1".into(),
        }
    }

    async fn collect(stream: TextStream) -> Vec<Result<String, DingflowError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn default_fragment_when_queue_empty() {
        let provider = MockProvider::new();
        let items = collect(provider.stream(request("hi")).await.unwrap()).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "mock response");
    }

    #[tokio::test]
    async fn scripts_replay_in_order_and_requests_are_recorded() {
        let provider = MockProvider::with_scripts(vec![
            Script::fragments(["hello ", "world"]),
            Script::interrupted(["partial"], "connection reset"),
        ]);

        let first = collect(provider.stream(request("one")).await.unwrap()).await;
        let texts: Vec<_> = first.into_iter().map(Result::unwrap).collect();
        assert_eq!(texts, vec!["hello ", "world"]);

        let second = collect(provider.stream(request("two")).await.unwrap()).await;
        assert_eq!(second.len(), 2);
        assert!(second[1].is_err());

        let requests = provider.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].user_content, "two");
    }

    #[tokio::test]
    async fn rejected_script_fails_before_streaming() {
        let provider = MockProvider::with_scripts(vec![Script::rejected(502)]);
        let err = match provider.stream(request("x")).await {
            Err(e) => e,
            Ok(_) => panic!("expected rejection"),
        };
        assert!(matches!(err, DingflowError::Completion { status: 502, .. }));
        assert_eq!(provider.call_count().await, 1);
    }
}
