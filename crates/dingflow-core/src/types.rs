// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types shared between the transport, the completion backend and the
//! message handler.

use std::pin::Pin;

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::DingflowError;

/// Unique identifier for an inbound message, as assigned by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

/// Health status reported by adapter health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

/// Whether a conversation is a one-to-one chat with the robot or a group chat.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    /// Maps the provider's `conversationType` field (`"1"` direct, `"2"` group).
    pub fn from_wire(value: &str) -> Self {
        if value == "2" { Self::Group } else { Self::Direct }
    }
}

/// A message quoted by the sender when replying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub sender: Option<String>,
    pub text: String,
}

/// One entry of a forwarded chat-record batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRecord {
    pub sender: Option<String>,
    pub text: String,
}

/// Canonical body of an inbound message, normalised from every known payload shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text {
        text: String,
        quoted: Option<Quote>,
    },
    RichText {
        text: String,
        picture_codes: Vec<String>,
    },
    Picture {
        download_code: String,
    },
    File {
        download_code: String,
        file_name: String,
    },
    Audio {
        recognition: Option<String>,
        download_code: Option<String>,
    },
    Video {
        download_code: String,
    },
    Forwarded {
        records: Vec<ForwardedRecord>,
    },
    /// A payload shape the decoder does not know. Never guessed at.
    Unrecognized {
        msgtype: String,
    },
}

/// An inbound message received from the transport, already decoded.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Account the message arrived on (one stream connection per account).
    pub account_id: String,
    pub message_id: MessageId,
    pub sender_id: String,
    /// Staff id of the sender inside the organisation, used for direct addressing.
    pub sender_staff_id: Option<String>,
    pub sender_nick: Option<String>,
    pub conversation_id: String,
    pub conversation_kind: ConversationKind,
    pub robot_code: Option<String>,
    /// Short-lived reply endpoint bound to this message.
    pub session_webhook: Option<String>,
    pub body: MessageBody,
}

impl InboundMessage {
    /// The user identifier used for direct-chat addressing.
    pub fn reply_user_id(&self) -> &str {
        self.sender_staff_id.as_deref().unwrap_or(&self.sender_id)
    }
}

/// A single role/content pair sent to the completion backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A request for a streamed completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub user_content: String,
    pub system_instructions: Vec<String>,
    /// Opaque session key forwarded as the backend `user` field.
    pub session_key: String,
}

impl CompletionRequest {
    /// Assembles the `messages` array: system instructions first, then the user turn.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.system_instructions
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(ChatMessage::system)
            .chain(std::iter::once(ChatMessage::user(self.user_content.clone())))
            .collect()
    }
}

/// Lazy, single-pass sequence of text fragments from the completion backend.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, DingflowError>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_kind_from_wire() {
        assert_eq!(ConversationKind::from_wire("1"), ConversationKind::Direct);
        assert_eq!(ConversationKind::from_wire("2"), ConversationKind::Group);
        assert_eq!(ConversationKind::from_wire(""), ConversationKind::Direct);
    }

    #[test]
    fn request_messages_put_system_first() {
        let req = CompletionRequest {
            user_content: "hi".into(),
            system_instructions: vec!["be brief".into(), "  ".into()],
            session_key: "dingtalk:u1:1".into(),
        };
        let msgs = req.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], ChatMessage::system("be brief"));
        assert_eq!(msgs[1], ChatMessage::user("hi"));
    }
}
