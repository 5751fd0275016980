// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder for robot message callbacks.
//!
//! Every payload shape the robot receives is normalised into one
//! [`InboundMessage`]. Shapes not listed here become
//! [`MessageBody::Unrecognized`] rather than being guessed at.

use dingflow_core::DingflowError;
use dingflow_core::types::{
    ConversationKind, ForwardedRecord, InboundMessage, MessageBody, MessageId, Quote,
};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCallback {
    msg_id: String,
    #[serde(default)]
    msgtype: String,
    #[serde(default)]
    text: Option<RawText>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    sender_id: String,
    sender_staff_id: Option<String>,
    sender_nick: Option<String>,
    conversation_id: String,
    #[serde(default)]
    conversation_type: String,
    robot_code: Option<String>,
    session_webhook: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawText {
    #[serde(default)]
    content: String,
    #[serde(default)]
    replied_msg: Option<RawReplied>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReplied {
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaContent {
    download_code: Option<String>,
    picture_download_code: Option<String>,
    file_name: Option<String>,
    recognition: Option<String>,
}

impl MediaContent {
    fn code(&self) -> Option<String> {
        self.download_code
            .clone()
            .or_else(|| self.picture_download_code.clone())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RichTextContent {
    #[serde(default)]
    rich_text: Vec<RichTextItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RichTextItem {
    text: Option<String>,
    download_code: Option<String>,
    picture_download_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRecord {
    sender_nick: Option<String>,
    sender_id: Option<String>,
    #[serde(default)]
    content: Value,
}

/// Decodes the `data` string of a bot-message stream frame.
pub fn decode_callback(account_id: &str, data: &str) -> Result<InboundMessage, DingflowError> {
    let raw: RawCallback = serde_json::from_str(data)
        .map_err(|e| DingflowError::Validation(format!("malformed robot callback: {e}")))?;

    let body = decode_body(&raw);
    Ok(InboundMessage {
        account_id: account_id.to_string(),
        message_id: MessageId(raw.msg_id),
        sender_id: raw.sender_id,
        sender_staff_id: raw.sender_staff_id.filter(|s| !s.is_empty()),
        sender_nick: raw.sender_nick,
        conversation_id: raw.conversation_id,
        conversation_kind: ConversationKind::from_wire(&raw.conversation_type),
        robot_code: raw.robot_code,
        session_webhook: raw.session_webhook,
        body,
    })
}

fn decode_body(raw: &RawCallback) -> MessageBody {
    let content = raw.content.clone().unwrap_or(Value::Null);
    let media = || serde_json::from_value::<MediaContent>(content.clone()).unwrap_or_default();

    match raw.msgtype.as_str() {
        "text" => {
            let text = raw.text.as_ref();
            MessageBody::Text {
                text: text.map(|t| t.content.trim().to_string()).unwrap_or_default(),
                quoted: text.and_then(|t| t.replied_msg.as_ref()).and_then(quote_of),
            }
        }
        "richText" => {
            let rich: RichTextContent = serde_json::from_value(content.clone()).unwrap_or_default();
            let mut text = String::new();
            let mut picture_codes = Vec::new();
            for item in rich.rich_text {
                if let Some(t) = item.text {
                    text.push_str(&t);
                }
                if let Some(code) = item.download_code.or(item.picture_download_code) {
                    picture_codes.push(code);
                }
            }
            MessageBody::RichText {
                text: text.trim().to_string(),
                picture_codes,
            }
        }
        "picture" => match media().code() {
            Some(download_code) => MessageBody::Picture { download_code },
            None => unrecognized(raw),
        },
        "file" => {
            let media = media();
            match media.code() {
                Some(download_code) => MessageBody::File {
                    download_code,
                    file_name: media.file_name.unwrap_or_else(|| "file".to_string()),
                },
                None => unrecognized(raw),
            }
        }
        "audio" => {
            let media = media();
            MessageBody::Audio {
                download_code: media.code(),
                recognition: media.recognition.filter(|r| !r.trim().is_empty()),
            }
        }
        "video" => match media().code() {
            Some(download_code) => MessageBody::Video { download_code },
            None => unrecognized(raw),
        },
        "chatRecord" => MessageBody::Forwarded {
            records: forwarded_records(&content),
        },
        _ => unrecognized(raw),
    }
}

fn unrecognized(raw: &RawCallback) -> MessageBody {
    MessageBody::Unrecognized {
        msgtype: raw.msgtype.clone(),
    }
}

/// Text of a replied-to message; only text and rich-text replies are quoted.
fn quote_of(replied: &RawReplied) -> Option<Quote> {
    let text = match replied.content.as_ref()? {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(Value::String(t)) = map.get("text") {
                t.clone()
            } else if let Some(Value::Array(items)) = map.get("richText") {
                items
                    .iter()
                    .filter_map(|i| i.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            } else {
                return None;
            }
        }
        _ => return None,
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(Quote {
        sender: replied.sender_id.clone(),
        text: text.to_string(),
    })
}

/// The chat-record list arrives either as an array or as a JSON string.
fn forwarded_records(content: &Value) -> Vec<ForwardedRecord> {
    let list = match content.get("chatRecord") {
        Some(Value::String(encoded)) => serde_json::from_str::<Vec<RawRecord>>(encoded).unwrap_or_default(),
        Some(value @ Value::Array(_)) => {
            serde_json::from_value::<Vec<RawRecord>>(value.clone()).unwrap_or_default()
        }
        _ => Vec::new(),
    };
    list.into_iter()
        .filter_map(|r| {
            let text = match r.content {
                Value::String(s) => s,
                Value::Null => return None,
                other => other
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            Some(ForwardedRecord {
                sender: r.sender_nick.or(r.sender_id),
                text,
            })
        })
        .collect()
}
