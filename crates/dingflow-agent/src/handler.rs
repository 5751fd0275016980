// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message handler: turns one inbound message into one reply.
//!
//! The handler resolves the sender's session, renders the message into a
//! prompt and streams the completion either into a live AI card or, when no
//! card can be created, into a single batched markdown message. Media markers
//! in the finished text are processed before the final update.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dingflow_config::model::{AccountConfig, DingflowConfig};
use dingflow_core::types::{
    CompletionRequest, ConversationKind, ForwardedRecord, InboundMessage, MessageBody, Quote,
};
use dingflow_core::{CompletionProvider, DingflowError};
use dingflow_dingtalk::markers;
use dingflow_dingtalk::{CardCache, CardInstance, CardTarget, Destination, MediaPipeline, Messenger, Recipient};

use crate::dedup::DedupStore;
use crate::prompt::system_instructions;
use crate::session::{SessionStore, is_new_session_command};

/// Confirmation sent after a session reset.
pub const NEW_SESSION_REPLY: &str = "✨ New conversation started. Previous context has been cleared.";

/// Sent when the backend fails before producing any text.
pub const ERROR_REPLY: &str = "⚠️ Sorry, something went wrong while generating a reply. Please try again later.";

/// Appended to partial text when streaming stops early.
pub const INTERRUPTED_NOTICE: &str = "⚠️ The response was interrupted.";

/// Shown when the backend finished without any text.
pub const EMPTY_REPLY: &str = "(no reply)";

/// Attempts to obtain a live card before falling back to batched mode.
const CARD_ACQUIRE_ATTEMPTS: usize = 3;

/// Longest markdown title, in characters.
const TITLE_MAX_CHARS: usize = 20;

/// Tunables of [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub throttle: Duration,
    pub session_timeout: Duration,
    pub session_max_age: Duration,
    pub card_enabled: bool,
    pub media_markers: bool,
    pub media_dir: PathBuf,
    pub system_instructions: Vec<String>,
}

impl HandlerSettings {
    pub fn from_config(config: &DingflowConfig) -> Self {
        let bridge = &config.bridge;
        Self {
            throttle: Duration::from_millis(bridge.stream_throttle_ms),
            session_timeout: Duration::from_secs(bridge.session_timeout_secs),
            session_max_age: Duration::from_secs(bridge.session_max_age_secs),
            card_enabled: config.dingtalk.card_enabled,
            media_markers: bridge.enable_media_markers,
            media_dir: PathBuf::from(&bridge.media_dir),
            system_instructions: system_instructions(bridge),
        }
    }
}

/// What [`MessageHandler::handle`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Already seen within the dedup window.
    Duplicate,
    /// Nothing to answer.
    Ignored,
    /// Session reset and confirmed; no completion was requested.
    SessionReset,
    /// Reply streamed into an AI card.
    Card,
    /// Reply sent as one markdown message.
    Batched,
}

/// Counts from one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cards: usize,
    pub sessions: usize,
    pub dedup: usize,
}

/// Handles inbound messages for every configured account.
pub struct MessageHandler {
    provider: Arc<dyn CompletionProvider>,
    cards: Arc<CardCache>,
    messenger: Messenger,
    media: MediaPipeline,
    sessions: Arc<SessionStore>,
    dedup: Arc<DedupStore>,
    accounts: HashMap<String, Arc<AccountConfig>>,
    settings: HandlerSettings,
}

impl MessageHandler {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        cards: Arc<CardCache>,
        messenger: Messenger,
        sessions: Arc<SessionStore>,
        dedup: Arc<DedupStore>,
        accounts: impl IntoIterator<Item = Arc<AccountConfig>>,
        settings: HandlerSettings,
    ) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|account| (account.id.clone(), account))
            .collect();
        Self {
            provider,
            cards,
            media: MediaPipeline::new(messenger.clone()),
            messenger,
            sessions,
            dedup,
            accounts,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        &self.dedup
    }

    /// Processes one inbound message end to end.
    pub async fn handle(&self, msg: InboundMessage) -> Result<HandleOutcome, DingflowError> {
        let msg_id = msg.message_id.0.as_str();
        if !self.dedup.check_and_mark(msg_id) {
            debug!(msg_id, "duplicate message dropped");
            return Ok(HandleOutcome::Duplicate);
        }

        let account = self.accounts.get(&msg.account_id).cloned().ok_or_else(|| {
            DingflowError::Config(format!("message for unknown account '{}'", msg.account_id))
        })?;
        let dest = Destination {
            account: Arc::clone(&account),
            recipient: recipient_for(&msg),
        };

        if let MessageBody::Text { text, .. } = &msg.body
            && is_new_session_command(text)
        {
            let resolution = self
                .sessions
                .resolve(&msg.sender_id, true, self.settings.session_timeout);
            info!(msg_id, session_key = %resolution.session_key, "session reset by command");
            self.messenger.send_text(&dest, NEW_SESSION_REPLY).await?;
            return Ok(HandleOutcome::SessionReset);
        }

        let Some(user_content) = self.user_content(&msg, &account).await else {
            debug!(msg_id, "message has no content to answer");
            return Ok(HandleOutcome::Ignored);
        };

        let resolution = self
            .sessions
            .resolve(&msg.sender_id, false, self.settings.session_timeout);
        let request = CompletionRequest {
            user_content,
            system_instructions: self.settings.system_instructions.clone(),
            session_key: resolution.session_key,
        };
        info!(
            msg_id,
            conversation_id = %msg.conversation_id,
            session_key = %request.session_key,
            "handling message"
        );

        if self.settings.card_enabled {
            let target = CardTarget {
                account_id: account.id.clone(),
                conversation_id: msg.conversation_id.clone(),
                recipient: dest.recipient.clone(),
            };
            if let Some(card) = self.acquire_card(&account, &target).await {
                self.reply_with_card(card, request, &dest).await?;
                return Ok(HandleOutcome::Card);
            }
            info!(msg_id, "card unavailable, falling back to batched reply");
        }

        self.reply_batched(request, &dest).await?;
        Ok(HandleOutcome::Batched)
    }

    /// Evicts finished cards, idle sessions and expired dedup entries.
    pub fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            cards: self.cards.cleanup(),
            sessions: self.sessions.sweep(self.settings.session_max_age),
            dedup: self.dedup.purge(),
        };
        debug!(?report, "maintenance sweep finished");
        report
    }

    /// Last sweep before exit.
    pub fn shutdown_sweep(&self) -> SweepReport {
        let report = self.sweep();
        self.dedup.clear();
        report
    }

    /// Locks a live card for `target`.
    ///
    /// A card obtained from the cache may finish while this task waits for
    /// its lock; in that case a fresh one is requested.
    async fn acquire_card(
        &self,
        account: &Arc<AccountConfig>,
        target: &CardTarget,
    ) -> Option<OwnedMutexGuard<CardInstance>> {
        for _ in 0..CARD_ACQUIRE_ATTEMPTS {
            let shared = self.cards.get_or_create(account, target).await?;
            let card = shared.lock_owned().await;
            if !card.state.is_terminal() {
                return Some(card);
            }
        }
        None
    }

    async fn reply_with_card(
        &self,
        mut card: OwnedMutexGuard<CardInstance>,
        request: CompletionRequest,
        dest: &Destination,
    ) -> Result<(), DingflowError> {
        let engine = self.cards.engine();
        let mut stream = match self.provider.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(out_track_id = %card.out_track_id, error = %e, "completion request failed");
                engine.abort(&mut card, ERROR_REPLY).await;
                return Err(e);
            }
        };

        let mut text = String::new();
        let mut shown = String::new();
        let mut last_push: Option<Instant> = None;
        let mut failure = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => text.push_str(&fragment),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            if last_push.is_some_and(|at| at.elapsed() < self.settings.throttle) {
                continue;
            }
            let display = self.display_text(&text);
            if display.trim().is_empty() || display == shown {
                continue;
            }
            if let Err(e) = engine.push(&mut card, &display, false).await {
                failure = Some(e);
                break;
            }
            last_push = Some(Instant::now());
            shown = display;
        }
        drop(stream);

        if let Some(e) = failure {
            warn!(out_track_id = %card.out_track_id, error = %e, "streaming interrupted");
            let notice = with_interruption(&markers::strip_all(&text));
            if card.state.is_terminal() || engine.finish(&mut card, &notice).await.is_err() {
                engine.abort(&mut card, &notice).await;
            }
            return Err(e);
        }

        let reply = self.final_text(&text, dest).await;
        if let Err(e) = engine.finish(&mut card, &reply).await {
            warn!(out_track_id = %card.out_track_id, error = %e, "final card update failed");
            engine.abort(&mut card, &with_interruption(&reply)).await;
            return Err(e);
        }
        info!(out_track_id = %card.out_track_id, chars = reply.chars().count(), "card reply finished");
        Ok(())
    }

    async fn reply_batched(&self, request: CompletionRequest, dest: &Destination) -> Result<(), DingflowError> {
        let mut stream = match self.provider.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "completion request failed");
                if let Err(send_err) = self.messenger.send_text(dest, ERROR_REPLY).await {
                    warn!(error = %send_err, "error reply could not be sent");
                }
                return Err(e);
            }
        };

        let mut text = String::new();
        let mut failure = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => text.push_str(&fragment),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        drop(stream);

        let reply = match &failure {
            None => self.final_text(&text, dest).await,
            Some(_) if text.trim().is_empty() => ERROR_REPLY.to_string(),
            Some(e) => {
                warn!(error = %e, "streaming interrupted");
                with_interruption(&markers::strip_all(&text))
            }
        };
        self.messenger
            .send_markdown(dest, &reply_title(&reply), &reply)
            .await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Text shown on the card while the reply is still streaming.
    fn display_text(&self, text: &str) -> String {
        if self.settings.media_markers {
            markers::hide_for_display(text)
        } else {
            text.to_string()
        }
    }

    /// Runs the media pipeline on a finished reply.
    async fn final_text(&self, text: &str, dest: &Destination) -> String {
        let text = if self.settings.media_markers {
            let processed = self.media.process(text, dest).await;
            if !processed.outcomes.is_empty() {
                debug!(outcomes = ?processed.outcomes, "media markers processed");
            }
            processed.text
        } else {
            text.to_string()
        };
        if text.trim().is_empty() {
            EMPTY_REPLY.to_string()
        } else {
            text
        }
    }

    /// Renders an inbound body into the prompt sent to the backend.
    async fn user_content(&self, msg: &InboundMessage, account: &AccountConfig) -> Option<String> {
        let content = match &msg.body {
            MessageBody::Text { text, quoted } => {
                let mut out = quoted.as_ref().map(render_quote).unwrap_or_default();
                out.push_str(text.trim());
                out
            }
            MessageBody::RichText { text, picture_codes } => {
                let mut parts = vec![text.trim().to_string()];
                for code in picture_codes {
                    parts.push(self.attachment(account, "Image", code, "image.png").await);
                }
                parts.retain(|p| !p.is_empty());
                parts.join("\n")
            }
            MessageBody::Picture { download_code } => {
                self.attachment(account, "Image", download_code, "image.png").await
            }
            MessageBody::File {
                download_code,
                file_name,
            } => self.attachment(account, "File", download_code, file_name).await,
            MessageBody::Audio {
                recognition: Some(text),
                ..
            } if !text.trim().is_empty() => text.trim().to_string(),
            MessageBody::Audio {
                download_code: Some(code),
                ..
            } => self.attachment(account, "Audio", code, "voice.amr").await,
            MessageBody::Audio { .. } => String::new(),
            MessageBody::Video { download_code } => {
                self.attachment(account, "Video", download_code, "video.mp4").await
            }
            MessageBody::Forwarded { records } => render_forwarded(records),
            MessageBody::Unrecognized { msgtype } => {
                debug!(msgtype = %msgtype, "unrecognized message type ignored");
                return None;
            }
        };
        let content = content.trim();
        (!content.is_empty()).then(|| content.to_string())
    }

    /// Downloads an attachment and returns a prompt line pointing at it.
    async fn attachment(&self, account: &AccountConfig, label: &str, download_code: &str, file_name: &str) -> String {
        match self
            .messenger
            .download_attachment(account, download_code, &self.settings.media_dir, file_name)
            .await
        {
            Ok(path) => format!("[{label}: {}]", path.display()),
            Err(e) => {
                warn!(label, error = %e, "attachment download failed");
                format!("[{label}: download failed]")
            }
        }
    }
}

/// Group replies go to the conversation; direct replies to the sender.
fn recipient_for(msg: &InboundMessage) -> Recipient {
    match msg.conversation_kind {
        ConversationKind::Group => Recipient::Group(msg.conversation_id.clone()),
        ConversationKind::Direct => Recipient::User(msg.reply_user_id().to_string()),
    }
}

fn render_quote(quote: &Quote) -> String {
    let mut out = String::new();
    for (i, line) in quote.text.trim().lines().enumerate() {
        match (&quote.sender, i) {
            (Some(sender), 0) => out.push_str(&format!("> {sender}: {line}\n")),
            _ => out.push_str(&format!("> {line}\n")),
        }
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn render_forwarded(records: &[ForwardedRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut out = String::from("Forwarded chat records:");
    for record in records {
        let sender = record.sender.as_deref().unwrap_or("unknown");
        out.push_str(&format!("\n{sender}: {}", record.text.trim()));
    }
    out
}

fn with_interruption(text: &str) -> String {
    let text = text.trim_end();
    if text.is_empty() {
        INTERRUPTED_NOTICE.to_string()
    } else {
        format!("{text}\n\n{INTERRUPTED_NOTICE}")
    }
}

/// Title of a markdown reply: its first non-empty line, shortened.
fn reply_title(text: &str) -> String {
    let line = text
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("Reply");
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    if line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_is_rendered_as_block() {
        let quote = Quote {
            sender: Some("Alice".into()),
            text: "line one\nline two".into(),
        };
        assert_eq!(render_quote(&quote), "> Alice: line one\n> line two\n\n");
    }

    #[test]
    fn forwarded_records_one_per_line() {
        let records = vec![
            ForwardedRecord {
                sender: Some("Bob".into()),
                text: "hi".into(),
            },
            ForwardedRecord {
                sender: None,
                text: " there ".into(),
            },
        ];
        assert_eq!(
            render_forwarded(&records),
            "Forwarded chat records:\nBob: hi\nunknown: there"
        );
        assert_eq!(render_forwarded(&[]), "");
    }

    #[test]
    fn interruption_notice_is_appended() {
        assert_eq!(with_interruption("partial  "), format!("partial\n\n{INTERRUPTED_NOTICE}"));
        assert_eq!(with_interruption(""), INTERRUPTED_NOTICE);
    }

    #[test]
    fn title_uses_first_line() {
        assert_eq!(reply_title("\n## Summary\nbody"), "Summary");
        assert_eq!(reply_title(""), "Reply");
        let long = "a".repeat(30);
        assert_eq!(reply_title(&long).chars().count(), TITLE_MAX_CHARS + 1);
    }
}
