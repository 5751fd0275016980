// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! AI card lifecycle: create, switch to inputting, stream full-content
//! replacements, finalize.
//!
//! A card moves `Processing -> Inputting -> Finished | Failed` and never
//! leaves a terminal state. Every content push carries the complete text,
//! so callers can throttle freely without tracking what was already sent.
//!
//! Authorization failures get one credential refresh and one retry of the
//! same update. Any other failure marks the card `Failed` and is returned
//! to the caller, who is expected to call [`CardEngine::abort`] so the card
//! does not stay open.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dingflow_config::model::AccountConfig;
use dingflow_core::DingflowError;
use dingflow_resilience::{RetryPolicy, retry};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{DingTalkClient, Recipient};
use crate::token::TokenCache;

/// Credentials older than this are refreshed before the next push.
pub const TOKEN_REFRESH_AFTER: Duration = Duration::from_secs(90 * 60);

/// Card data key holding the streamed markdown.
const CONTENT_KEY: &str = "msgContent";

/// Card flow status as understood by the AI card template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Processing,
    Inputting,
    Finished,
    /// Defined by the template protocol; no transition here ever enters it.
    Executing,
    Failed,
}

impl FlowStatus {
    pub fn wire_value(self) -> &'static str {
        match self {
            Self::Processing => "1",
            Self::Inputting => "2",
            Self::Finished => "3",
            Self::Executing => "4",
            Self::Failed => "5",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Processing => 0,
            Self::Inputting | Self::Executing => 1,
            Self::Finished | Self::Failed => 2,
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Processing => "processing",
            Self::Inputting => "inputting",
            Self::Finished => "finished",
            Self::Executing => "executing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lookup key for the active card of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub account_id: String,
    pub conversation_id: String,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.conversation_id)
    }
}

/// Where a card is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardTarget {
    pub account_id: String,
    pub conversation_id: String,
    pub recipient: Recipient,
}

impl CardTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            account_id: self.account_id.clone(),
            conversation_id: self.conversation_id.clone(),
        }
    }

    fn open_space_id(&self) -> String {
        match &self.recipient {
            Recipient::Group(cid) => format!("dtv1.card//IM_GROUP.{cid}"),
            Recipient::User(user_id) => format!("dtv1.card//IM_ROBOT.{user_id}"),
        }
    }
}

/// One live card in one conversation.
#[derive(Debug, Clone)]
pub struct CardInstance {
    pub out_track_id: String,
    pub access_token: String,
    pub token_issued_at: Instant,
    pub target: CardTarget,
    pub account: Arc<AccountConfig>,
    pub template_id: String,
    pub created_at: Instant,
    pub last_updated: Instant,
    pub state: FlowStatus,
    /// Whether the `Inputting` status update has been issued.
    pub inputting_started: bool,
}

impl CardInstance {
    fn touch(&mut self) {
        self.last_updated = self.last_updated.max(Instant::now());
    }

    /// Moves forward only; terminal states are sticky.
    fn advance(&mut self, next: FlowStatus) {
        if !self.state.is_terminal() && next.rank() >= self.state.rank() {
            self.state = next;
        }
    }

    fn mark_failed(&mut self) {
        self.advance(FlowStatus::Failed);
        self.touch();
    }
}

/// Drives cards through their lifecycle against the provider API.
pub struct CardEngine {
    client: Arc<DingTalkClient>,
    tokens: Arc<TokenCache>,
    retry: RetryPolicy,
    default_template_id: String,
    token_refresh_after: Duration,
}

impl CardEngine {
    pub fn new(
        client: Arc<DingTalkClient>,
        tokens: Arc<TokenCache>,
        retry: RetryPolicy,
        default_template_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            tokens,
            retry,
            default_template_id: default_template_id.into(),
            token_refresh_after: TOKEN_REFRESH_AFTER,
        }
    }

    /// Overrides the credential age that triggers a pre-emptive refresh.
    pub fn with_token_refresh_after(mut self, after: Duration) -> Self {
        self.token_refresh_after = after;
        self
    }

    /// Creates and delivers a card. Returns `None` on any failure.
    pub async fn create(&self, account: &Arc<AccountConfig>, target: &CardTarget) -> Option<CardInstance> {
        let credential = match self.tokens.get(&account.client_id, &account.client_secret).await {
            Ok(c) => c,
            Err(e) => {
                warn!(account = %account.id, error = %e, "no access token for card creation");
                return None;
            }
        };

        let template_id = account
            .card_template_id
            .clone()
            .unwrap_or_else(|| self.default_template_id.clone());
        let out_track_id = format!("card_{}", Uuid::new_v4());
        let body = create_body(&template_id, &out_track_id, target, account.robot_code());

        let created = retry(&self.retry, || {
            self.client.create_and_deliver_card(&credential.token, &body)
        })
        .await;
        if let Err(e) = created {
            warn!(
                conversation_id = %target.conversation_id,
                error = %e,
                "card creation failed"
            );
            return None;
        }

        info!(
            out_track_id = %out_track_id,
            conversation_id = %target.conversation_id,
            "card created"
        );
        let now = Instant::now();
        Some(CardInstance {
            out_track_id,
            access_token: credential.token,
            token_issued_at: credential.issued_at,
            target: target.clone(),
            account: Arc::clone(account),
            template_id,
            created_at: now,
            last_updated: now,
            state: FlowStatus::Processing,
            inputting_started: false,
        })
    }

    /// Replaces the card content with `content`.
    ///
    /// Issues the `Inputting` status update once before the first content
    /// push. With `finalize` the card ends `Finished` on success.
    pub async fn push(&self, card: &mut CardInstance, content: &str, finalize: bool) -> Result<(), DingflowError> {
        if card.state.is_terminal() {
            return Err(DingflowError::Validation(format!(
                "card {} is already {}",
                card.out_track_id, card.state
            )));
        }

        self.refresh_if_stale(card).await;

        let first = self.send_update(card, content, finalize).await;
        let result = match first {
            Err(e) if e.is_auth() => {
                debug!(out_track_id = %card.out_track_id, "card token rejected, refreshing once");
                match self.force_refresh(card).await {
                    Ok(()) => self.send_update(card, content, finalize).await,
                    Err(refresh_err) => Err(refresh_err),
                }
            }
            other => other,
        };

        match result {
            Ok(()) => {
                card.touch();
                card.advance(if finalize {
                    FlowStatus::Finished
                } else {
                    FlowStatus::Inputting
                });
                Ok(())
            }
            Err(e) => {
                warn!(out_track_id = %card.out_track_id, error = %e, "card update failed");
                card.mark_failed();
                Err(e)
            }
        }
    }

    /// Final push plus a best-effort `Finished` status update.
    pub async fn finish(&self, card: &mut CardInstance, content: &str) -> Result<(), DingflowError> {
        self.push(card, content, true).await?;

        let body = status_body(&card.out_track_id, FlowStatus::Finished, Some(content));
        if let Err(e) = self.client.update_card(&card.access_token, &body).await {
            // The finalized stream already closed the card on the client side.
            warn!(out_track_id = %card.out_track_id, error = %e, "finished status update failed");
        }
        Ok(())
    }

    /// Best-effort close of a card after an unrecoverable error.
    ///
    /// Finalizes the stream with `content` and sets the `Failed` status.
    /// Never fails; problems are logged.
    pub async fn abort(&self, card: &mut CardInstance, content: &str) {
        let stream = streaming_body(&card.out_track_id, content, true);
        if let Err(e) = self.client.stream_card(&card.access_token, &stream).await {
            warn!(out_track_id = %card.out_track_id, error = %e, "final card push failed");
        }
        let status = status_body(&card.out_track_id, FlowStatus::Failed, Some(content));
        if let Err(e) = self.client.update_card(&card.access_token, &status).await {
            warn!(out_track_id = %card.out_track_id, error = %e, "failed status update failed");
        }
        card.mark_failed();
    }

    async fn send_update(&self, card: &mut CardInstance, content: &str, finalize: bool) -> Result<(), DingflowError> {
        if !card.inputting_started {
            let body = status_body(&card.out_track_id, FlowStatus::Inputting, None);
            self.client.update_card(&card.access_token, &body).await?;
            card.inputting_started = true;
        }
        let body = streaming_body(&card.out_track_id, content, finalize);
        self.client.stream_card(&card.access_token, &body).await
    }

    async fn refresh_if_stale(&self, card: &mut CardInstance) {
        if card.token_issued_at.elapsed() < self.token_refresh_after {
            return;
        }
        if let Err(e) = self.force_refresh(card).await {
            warn!(out_track_id = %card.out_track_id, error = %e, "pre-emptive token refresh failed");
        }
    }

    async fn force_refresh(&self, card: &mut CardInstance) -> Result<(), DingflowError> {
        let credential = self
            .tokens
            .refresh(&card.account.client_id, &card.account.client_secret)
            .await?;
        card.access_token = credential.token;
        card.token_issued_at = credential.issued_at;
        Ok(())
    }
}

fn create_body(template_id: &str, out_track_id: &str, target: &CardTarget, robot_code: &str) -> Value {
    let mut body = json!({
        "cardTemplateId": template_id,
        "outTrackId": out_track_id,
        "cardData": {
            "cardParamMap": {
                "flowStatus": FlowStatus::Processing.wire_value(),
                CONTENT_KEY: "",
            }
        },
        "callbackType": "STREAM",
        "openSpaceId": target.open_space_id(),
        "userIdType": 1,
    });
    let (deliver_key, deliver, space_key) = match &target.recipient {
        Recipient::Group(_) => (
            "imGroupOpenDeliverModel",
            json!({ "robotCode": robot_code }),
            "imGroupOpenSpaceModel",
        ),
        Recipient::User(_) => (
            "imRobotOpenDeliverModel",
            json!({ "spaceType": "IM_ROBOT" }),
            "imRobotOpenSpaceModel",
        ),
    };
    body[deliver_key] = deliver;
    body[space_key] = json!({ "supportForward": true });
    body
}

fn status_body(out_track_id: &str, status: FlowStatus, content: Option<&str>) -> Value {
    let mut params = json!({ "flowStatus": status.wire_value() });
    if let Some(content) = content {
        params[CONTENT_KEY] = Value::from(content);
    }
    json!({
        "outTrackId": out_track_id,
        "cardData": { "cardParamMap": params },
        "cardUpdateOptions": { "updateCardDataByKey": true },
    })
}

fn streaming_body(out_track_id: &str, content: &str, finalize: bool) -> Value {
    json!({
        "outTrackId": out_track_id,
        "guid": Uuid::new_v4().to_string(),
        "key": CONTENT_KEY,
        "content": content,
        "isFull": true,
        "isFinalize": finalize,
        "isError": false,
    })
}
