// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Builders for inbound messages and accounts used across test suites.

use dingflow_config::model::AccountConfig;
use dingflow_core::types::{ConversationKind, InboundMessage, MessageBody, MessageId};

/// A direct-chat text message on the `default` account.
pub fn text_message(message_id: &str, sender: &str, text: &str) -> InboundMessage {
    message(
        message_id,
        sender,
        MessageBody::Text {
            text: text.to_string(),
            quoted: None,
        },
    )
}

/// A direct-chat message with an arbitrary body on the `default` account.
pub fn message(message_id: &str, sender: &str, body: MessageBody) -> InboundMessage {
    InboundMessage {
        account_id: "default".into(),
        message_id: MessageId(message_id.into()),
        sender_id: sender.into(),
        sender_staff_id: Some(format!("staff-{sender}")),
        sender_nick: Some(format!("nick-{sender}")),
        conversation_id: format!("cid-{sender}"),
        conversation_kind: ConversationKind::Direct,
        robot_code: Some("robot-1".into()),
        session_webhook: None,
        body,
    }
}

/// Turns a direct-chat message into a group message in `conversation_id`.
pub fn in_group(mut msg: InboundMessage, conversation_id: &str) -> InboundMessage {
    msg.conversation_kind = ConversationKind::Group;
    msg.conversation_id = conversation_id.into();
    msg
}

/// The `default` account with fixed test credentials.
pub fn account() -> AccountConfig {
    AccountConfig {
        id: "default".into(),
        client_id: "ding-app-key".into(),
        client_secret: "ding-app-secret".into(),
        robot_code: Some("robot-1".into()),
        enabled: true,
        card_template_id: None,
    }
}
