// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stream-mode transport: a WebSocket session per account that delivers
//! robot message callbacks.
//!
//! Every frame is acknowledged as soon as it is read, before the message is
//! handed to the consumer, so slow handling never causes redelivery. The
//! session is reopened with exponential backoff when the server asks for a
//! reconnect or the socket drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dingflow_config::model::AccountConfig;
use dingflow_core::DingflowError;
use dingflow_core::traits::ChannelAdapter;
use dingflow_core::types::{HealthStatus, InboundMessage};
use dingflow_resilience::RetryPolicy;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BOT_MESSAGE_TOPIC, DingTalkClient};
use crate::inbound::decode_callback;

const INBOUND_BUFFER: usize = 256;

/// Default reconnect backoff: 1 s doubling up to 60 s.
pub fn default_reconnect_policy() -> RetryPolicy {
    RetryPolicy::new(u32::MAX, Duration::from_secs(1), Duration::from_secs(60))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    headers: FrameHeaders,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameHeaders {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    topic: String,
}

/// What to do with one text frame.
#[derive(Debug)]
pub enum FrameAction {
    /// Send `ack`, then hand `message` to the consumer.
    Deliver { ack: String, message: InboundMessage },
    /// Send the reply and nothing else.
    Reply(String),
    /// Close this session and open a new one.
    Reconnect,
    Ignore,
}

/// Builds the acknowledgement for frame `message_id`.
pub fn ack_frame(message_id: &str, data: &str) -> String {
    json!({
        "code": 200,
        "headers": { "contentType": "application/json", "messageId": message_id },
        "message": "OK",
        "data": data,
    })
    .to_string()
}

/// Interprets one text frame received on the socket.
pub fn handle_frame(account_id: &str, text: &str) -> FrameAction {
    let frame: StreamFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "unparseable stream frame");
            return FrameAction::Ignore;
        }
    };
    let id = frame.headers.message_id.as_str();

    match (frame.kind.as_str(), frame.headers.topic.as_str()) {
        ("SYSTEM", "ping") => FrameAction::Reply(ack_frame(id, &frame.data)),
        ("SYSTEM", "disconnect") => FrameAction::Reconnect,
        ("SYSTEM", topic) => {
            debug!(topic, "ignoring system frame");
            FrameAction::Ignore
        }
        ("CALLBACK", BOT_MESSAGE_TOPIC) => {
            let ack = ack_frame(id, r#"{"response":null}"#);
            match decode_callback(account_id, &frame.data) {
                Ok(message) => FrameAction::Deliver { ack, message },
                Err(e) => {
                    warn!(frame_id = id, error = %e, "undecodable robot callback");
                    FrameAction::Reply(ack)
                }
            }
        }
        (_, topic) => {
            debug!(kind = %frame.kind, topic, "acknowledging unhandled frame");
            FrameAction::Reply(ack_frame(id, r#"{"response":null}"#))
        }
    }
}

enum SessionEnd {
    Cancelled,
    Reconnect,
}

#[derive(Clone)]
struct SessionContext {
    account: Arc<AccountConfig>,
    client: Arc<DingTalkClient>,
    tx: mpsc::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    reconnect: RetryPolicy,
}

/// [`ChannelAdapter`] over the DingTalk stream gateway for one account.
pub struct DingTalkStreamClient {
    ctx: SessionContext,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    task: Option<JoinHandle<()>>,
}

impl DingTalkStreamClient {
    pub fn new(account: Arc<AccountConfig>, client: Arc<DingTalkClient>) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        Self {
            ctx: SessionContext {
                account,
                client,
                tx,
                connected: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
                reconnect: default_reconnect_policy(),
            },
            inbound_rx: Mutex::new(rx),
            task: None,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.ctx.reconnect = policy;
        self
    }
}

#[async_trait]
impl ChannelAdapter for DingTalkStreamClient {
    fn name(&self) -> &str {
        "dingtalk-stream"
    }

    fn account_id(&self) -> &str {
        &self.ctx.account.id
    }

    async fn connect(&mut self) -> Result<(), DingflowError> {
        if self.task.is_some() {
            return Ok(());
        }
        info!(account = %self.ctx.account.id, "starting DingTalk stream connection");
        let ctx = self.ctx.clone();
        self.task = Some(tokio::spawn(run_sessions(ctx)));
        Ok(())
    }

    async fn receive(&self) -> Result<InboundMessage, DingflowError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or_else(|| DingflowError::Channel {
            message: format!("stream for account {} closed", self.ctx.account.id),
            source: None,
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, DingflowError> {
        if self.ctx.connected.load(Ordering::Relaxed) {
            return Ok(HealthStatus::Healthy);
        }
        match &self.task {
            Some(task) if !task.is_finished() => Ok(HealthStatus::Degraded("reconnecting".into())),
            _ => Ok(HealthStatus::Unhealthy("not connected".into())),
        }
    }

    async fn shutdown(&self) -> Result<(), DingflowError> {
        debug!(account = %self.ctx.account.id, "DingTalk stream shutting down");
        self.ctx.cancel.cancel();
        Ok(())
    }
}

async fn run_sessions(ctx: SessionContext) {
    let mut failures: u32 = 0;
    loop {
        let result = run_session(&ctx).await;
        ctx.connected.store(false, Ordering::Relaxed);

        let delay = match result {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Reconnect) => {
                failures = 0;
                ctx.reconnect.base_delay
            }
            Err(e) => {
                let delay = ctx.reconnect.backoff(failures);
                failures = failures.saturating_add(1);
                warn!(
                    account = %ctx.account.id,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "stream session failed"
                );
                delay
            }
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!(account = %ctx.account.id, "DingTalk stream stopped");
}

async fn run_session(ctx: &SessionContext) -> Result<SessionEnd, DingflowError> {
    let ticket = ctx
        .client
        .open_stream_connection(&ctx.account.client_id, &ctx.account.client_secret)
        .await?;
    let url = reqwest::Url::parse_with_params(&ticket.endpoint, &[("ticket", ticket.ticket.as_str())])
        .map_err(|e| channel_error(format!("invalid stream endpoint: {e}"), None))?;

    let (socket, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| channel_error("stream websocket connect failed".into(), Some(Box::new(e))))?;
    ctx.connected.store(true, Ordering::Relaxed);
    info!(account = %ctx.account.id, "DingTalk stream connected");

    let (mut sink, mut source) = socket.split();
    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(SessionEnd::Cancelled);
            }
            frame = source.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(SessionEnd::Reconnect);
        };
        let frame = frame.map_err(|e| channel_error("stream read failed".into(), Some(Box::new(e))))?;

        match frame {
            WsMessage::Text(text) => match handle_frame(&ctx.account.id, text.as_str()) {
                FrameAction::Deliver { ack, message } => {
                    send_text(&mut sink, ack).await?;
                    debug!(msg_id = %message.message_id.0, "robot message received");
                    if ctx.tx.send(message).await.is_err() {
                        return Ok(SessionEnd::Cancelled);
                    }
                }
                FrameAction::Reply(reply) => send_text(&mut sink, reply).await?,
                FrameAction::Reconnect => {
                    info!(account = %ctx.account.id, "server requested reconnect");
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Reconnect);
                }
                FrameAction::Ignore => {}
            },
            WsMessage::Ping(payload) => {
                sink.send(WsMessage::Pong(payload))
                    .await
                    .map_err(|e| channel_error("stream pong failed".into(), Some(Box::new(e))))?;
            }
            WsMessage::Close(_) => return Ok(SessionEnd::Reconnect),
            _ => {}
        }
    }
}

async fn send_text<S>(sink: &mut S, text: String) -> Result<(), DingflowError>
where
    S: futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| channel_error("stream write failed".into(), Some(Box::new(e))))
}

fn channel_error(message: String, source: Option<Box<dyn std::error::Error + Send + Sync>>) -> DingflowError {
    DingflowError::Channel { message, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dingflow_core::types::MessageBody;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn callback_frame(msg_id: &str) -> String {
        let data = json!({
            "msgId": msg_id,
            "msgtype": "text",
            "text": {"content": "hello bot"},
            "senderId": "u-1",
            "senderStaffId": "staff-1",
            "conversationId": "cid-1",
            "conversationType": "1",
            "robotCode": "robot"
        });
        json!({
            "specVersion": "1.0",
            "type": "CALLBACK",
            "headers": {"messageId": "frame-1", "topic": BOT_MESSAGE_TOPIC, "contentType": "application/json"},
            "data": data.to_string()
        })
        .to_string()
    }

    fn ping_frame() -> String {
        json!({
            "specVersion": "1.0",
            "type": "SYSTEM",
            "headers": {"messageId": "ping-1", "topic": "ping"},
            "data": "{\"opaque\":\"abc\"}"
        })
        .to_string()
    }

    #[test]
    fn ping_is_echoed() {
        match handle_frame("default", &ping_frame()) {
            FrameAction::Reply(reply) => {
                let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
                assert_eq!(v["code"], 200);
                assert_eq!(v["headers"]["messageId"], "ping-1");
                assert_eq!(v["data"], "{\"opaque\":\"abc\"}");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn disconnect_requests_reconnect() {
        let frame = json!({"type": "SYSTEM", "headers": {"topic": "disconnect"}, "data": ""});
        assert!(matches!(handle_frame("default", &frame.to_string()), FrameAction::Reconnect));
    }

    #[test]
    fn callback_is_acknowledged_and_delivered() {
        match handle_frame("default", &callback_frame("msg-9")) {
            FrameAction::Deliver { ack, message } => {
                let v: serde_json::Value = serde_json::from_str(&ack).unwrap();
                assert_eq!(v["headers"]["messageId"], "frame-1");
                assert_eq!(v["message"], "OK");
                assert_eq!(message.message_id.0, "msg-9");
                assert_eq!(message.account_id, "default");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn broken_callback_is_still_acknowledged() {
        let frame = json!({
            "type": "CALLBACK",
            "headers": {"messageId": "frame-2", "topic": BOT_MESSAGE_TOPIC},
            "data": "{oops"
        });
        assert!(matches!(handle_frame("default", &frame.to_string()), FrameAction::Reply(_)));
        assert!(matches!(handle_frame("default", "not json"), FrameAction::Ignore));
    }

    #[tokio::test]
    async fn delivers_callbacks_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let api = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/gateway/connections/open"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"endpoint": format!("ws://{addr}/connect"), "ticket": "t-1"}),
            ))
            .mount(&api)
            .await;

        let ws_server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut replies = Vec::new();
            for frame in [ping_frame(), callback_frame("msg-1")] {
                ws.send(WsMessage::Text(frame.into())).await.unwrap();
                loop {
                    match ws.next().await.unwrap().unwrap() {
                        WsMessage::Text(t) => {
                            replies.push(t.as_str().to_string());
                            break;
                        }
                        _ => continue,
                    }
                }
            }
            replies
        });

        let account = Arc::new(AccountConfig {
            id: "default".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            robot_code: None,
            enabled: true,
            card_template_id: None,
        });
        let client = Arc::new(DingTalkClient::with_bases(&api.uri(), &api.uri()).unwrap());
        let mut channel = DingTalkStreamClient::new(account, client);
        channel.connect().await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), channel.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message_id.0, "msg-1");
        assert!(matches!(message.body, MessageBody::Text { ref text, .. } if text == "hello bot"));

        let replies = ws_server.await.unwrap();
        assert_eq!(replies.len(), 2);
        let pong: serde_json::Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(pong["headers"]["messageId"], "ping-1");
        let ack: serde_json::Value = serde_json::from_str(&replies[1]).unwrap();
        assert_eq!(ack["headers"]["messageId"], "frame-1");
        assert_eq!(ack["code"], 200);

        channel.shutdown().await.unwrap();
    }
}
