// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! REST client for the DingTalk open platform.
//!
//! Wraps the handful of endpoints the bridge needs: access-token issuance,
//! AI card create/update/stream, robot message send, media upload and the
//! two-step media download. Control-plane calls use a short timeout, media
//! transfers a long one.

use std::path::Path;
use std::time::Duration;

use dingflow_config::model::DingTalkConfig;
use dingflow_core::DingflowError;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Header carrying the access token on `api.dingtalk.com` calls.
pub const ACCESS_TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

/// Provider error code for a rejected access token.
const INVALID_AUTH_CODE: &str = "InvalidAuthentication";

/// Legacy `oapi` errcodes meaning the access token is invalid or expired.
const OAPI_AUTH_ERRCODES: [i64; 2] = [40014, 42001];

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const MEDIA_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a robot message or card is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// One-to-one chat with the robot, addressed by user (staff) id.
    User(String),
    /// Group chat, addressed by open conversation id.
    Group(String),
}

/// Upload category accepted by the media endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    File,
    Video,
    Voice,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::File => "file",
            Self::Video => "video",
            Self::Voice => "voice",
        }
    }
}

/// A freshly issued access token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Endpoint and ticket for one stream-mode WebSocket session.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamTicket {
    pub endpoint: String,
    pub ticket: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    access_token: String,
    expire_in: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadUrlResponse {
    download_url: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    media_id: Option<String>,
}

/// Topic of robot message callbacks in stream mode.
pub const BOT_MESSAGE_TOPIC: &str = "/v1.0/im/bot/messages/get";

/// HTTP client for DingTalk REST endpoints.
#[derive(Debug, Clone)]
pub struct DingTalkClient {
    http: reqwest::Client,
    media_http: reqwest::Client,
    control_timeout: Duration,
    media_timeout: Duration,
    api_base: String,
    oapi_base: String,
}

impl DingTalkClient {
    /// Creates a client pointed at the configured API hosts.
    pub fn new(config: &DingTalkConfig) -> Result<Self, DingflowError> {
        Self::with_bases(&config.api_base, &config.oapi_base)
    }

    /// Creates a client with explicit base URLs.
    pub fn with_bases(api_base: &str, oapi_base: &str) -> Result<Self, DingflowError> {
        Self::with_timeouts(api_base, oapi_base, CONTROL_TIMEOUT, MEDIA_TIMEOUT)
    }

    /// Creates a client with explicit base URLs and request timeouts for
    /// control-plane calls and media transfers.
    pub fn with_timeouts(
        api_base: &str,
        oapi_base: &str,
        control_timeout: Duration,
        media_timeout: Duration,
    ) -> Result<Self, DingflowError> {
        let build = |timeout: Duration| {
            reqwest::Client::builder()
                .connect_timeout(control_timeout.min(timeout))
                .timeout(timeout)
                .build()
                .map_err(|e| DingflowError::Internal(format!("failed to build HTTP client: {e}")))
        };
        Ok(Self {
            http: build(control_timeout)?,
            media_http: build(media_timeout)?,
            control_timeout,
            media_timeout,
            api_base: api_base.trim_end_matches('/').to_string(),
            oapi_base: oapi_base.trim_end_matches('/').to_string(),
        })
    }

    /// `POST /v1.0/oauth2/accessToken`.
    pub async fn fetch_access_token(
        &self,
        app_key: &str,
        app_secret: &str,
    ) -> Result<IssuedToken, DingflowError> {
        let body = json!({ "appKey": app_key, "appSecret": app_secret });
        let response: AccessTokenResponse = self
            .call(Method::POST, "/v1.0/oauth2/accessToken", None, &body)
            .await?;
        Ok(IssuedToken {
            token: response.access_token,
            expires_in: Duration::from_secs(response.expire_in),
        })
    }

    /// `POST /v1.0/card/instances/createAndDeliver`.
    pub async fn create_and_deliver_card(
        &self,
        token: &str,
        body: &Value,
    ) -> Result<(), DingflowError> {
        self.call::<Value>(
            Method::POST,
            "/v1.0/card/instances/createAndDeliver",
            Some(token),
            body,
        )
        .await
        .map(drop)
    }

    /// `PUT /v1.0/card/instances`, used for flow-status transitions.
    pub async fn update_card(&self, token: &str, body: &Value) -> Result<(), DingflowError> {
        self.call::<Value>(Method::PUT, "/v1.0/card/instances", Some(token), body)
            .await
            .map(drop)
    }

    /// `PUT /v1.0/card/streaming`, a full-content replace of one card key.
    pub async fn stream_card(&self, token: &str, body: &Value) -> Result<(), DingflowError> {
        self.call::<Value>(Method::PUT, "/v1.0/card/streaming", Some(token), body)
            .await
            .map(drop)
    }

    /// Sends a robot message to a user or group.
    ///
    /// `msg_param` is serialized to a JSON string, which is what the
    /// endpoint expects.
    pub async fn send_robot_message(
        &self,
        token: &str,
        robot_code: &str,
        recipient: &Recipient,
        msg_key: &str,
        msg_param: &Value,
    ) -> Result<(), DingflowError> {
        let msg_param = msg_param.to_string();
        let (path, body) = match recipient {
            Recipient::User(user_id) => (
                "/v1.0/robot/oToMessages/batchSend",
                json!({
                    "robotCode": robot_code,
                    "userIds": [user_id],
                    "msgKey": msg_key,
                    "msgParam": msg_param,
                }),
            ),
            Recipient::Group(conversation_id) => (
                "/v1.0/robot/groupMessages/send",
                json!({
                    "robotCode": robot_code,
                    "openConversationId": conversation_id,
                    "msgKey": msg_key,
                    "msgParam": msg_param,
                }),
            ),
        };
        self.call::<Value>(Method::POST, path, Some(token), &body)
            .await
            .map(drop)
    }

    /// Uploads a local file and returns its `media_id`.
    pub async fn upload_media(
        &self,
        token: &str,
        kind: UploadKind,
        path: &Path,
    ) -> Result<String, DingflowError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DingflowError::Validation(format!("cannot read {}: {e}", path.display()))
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let url = reqwest::Url::parse_with_params(
            &format!("{}/media/upload", self.oapi_base),
            &[("access_token", token), ("type", kind.as_str())],
        )
        .map_err(|e| DingflowError::Internal(format!("invalid upload URL: {e}")))?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| DingflowError::Internal(format!("invalid multipart mime: {e}")))?;
        let form = reqwest::multipart::Form::new().part("media", part);

        let response = self
            .media_http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error(e, self.media_timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, self.media_timeout))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: UploadResponse = serde_json::from_str(&text).map_err(|e| {
            DingflowError::remote(Some(status.as_u16()), format!("bad upload response: {e}"))
        })?;
        if OAPI_AUTH_ERRCODES.contains(&parsed.errcode) {
            return Err(DingflowError::Auth {
                message: parsed.errmsg,
            });
        }
        match parsed.media_id {
            Some(media_id) if parsed.errcode == 0 => {
                debug!(file = %file_name, kind = kind.as_str(), "media uploaded");
                Ok(media_id)
            }
            _ => Err(DingflowError::remote(
                Some(status.as_u16()),
                format!("upload rejected ({}): {}", parsed.errcode, parsed.errmsg),
            )),
        }
    }

    /// Resolves a message attachment's download code to a signed URL.
    pub async fn download_url(
        &self,
        token: &str,
        robot_code: &str,
        download_code: &str,
    ) -> Result<String, DingflowError> {
        let body = json!({ "downloadCode": download_code, "robotCode": robot_code });
        let response: DownloadUrlResponse = self
            .call(
                Method::POST,
                "/v1.0/robot/messageFiles/download",
                Some(token),
                &body,
            )
            .await?;
        Ok(response.download_url)
    }

    /// Fetches the bytes behind a signed download URL.
    pub async fn download_bytes(&self, url: &str) -> Result<Vec<u8>, DingflowError> {
        let response = self
            .media_http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, self.media_timeout))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, self.media_timeout))?;
        Ok(bytes.to_vec())
    }

    /// Opens a stream-mode connection ticket subscribed to robot messages.
    pub async fn open_stream_connection(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<StreamTicket, DingflowError> {
        let body = json!({
            "clientId": client_id,
            "clientSecret": client_secret,
            "subscriptions": [{ "type": "CALLBACK", "topic": BOT_MESSAGE_TOPIC }],
            "ua": concat!("dingflow/", env!("CARGO_PKG_VERSION")),
        });
        self.call(Method::POST, "/v1.0/gateway/connections/open", None, &body)
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: &Value,
    ) -> Result<T, DingflowError> {
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.api_base))
            .json(body);
        if let Some(token) = token {
            request = request.header(ACCESS_TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, self.control_timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, self.control_timeout))?;
        if !status.is_success() {
            warn!(path, status = %status, "DingTalk API call failed");
            return Err(status_error(status, &text));
        }

        // Several endpoints answer 200 with an empty body.
        let text = if text.trim().is_empty() { "{}" } else { &text };
        serde_json::from_str(text).map_err(|e| {
            DingflowError::remote(Some(status.as_u16()), format!("bad response from {path}: {e}"))
        })
    }
}

/// Maps a reqwest failure; `timeout` is the limit of the client that made the call.
fn transport_error(e: reqwest::Error, timeout: Duration) -> DingflowError {
    if e.is_timeout() {
        return DingflowError::Timeout { duration: timeout };
    }
    DingflowError::Remote {
        status: None,
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

fn status_error(status: StatusCode, body: &str) -> DingflowError {
    if status == StatusCode::UNAUTHORIZED || body.contains(INVALID_AUTH_CODE) {
        return DingflowError::Auth {
            message: format!("{status}: {body}"),
        };
    }
    DingflowError::remote(Some(status.as_u16()), format!("{status}: {body}"))
}
