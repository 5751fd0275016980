// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Dingflow bridge.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use serde::{Deserialize, Serialize};

/// Default AI card template published by the provider for streaming replies.
pub const DEFAULT_CARD_TEMPLATE_ID: &str = "382e4302-551d-4880-bf29-a30acfab2e71.schema";

/// Top-level Dingflow configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DingflowConfig {
    /// Bridge behaviour: sessions, throttling, sweeps.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Completion backend settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Messaging provider settings and robot accounts.
    #[serde(default)]
    pub dingtalk: DingTalkConfig,

    /// Backoff settings for transient remote failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl DingflowConfig {
    /// Accounts that should be connected.
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.dingtalk.accounts.iter().filter(|a| a.enabled)
    }
}

/// Bridge behaviour configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Inactivity after which a sender's next message starts a new session.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Sessions idle for longer than this are dropped by the periodic sweep.
    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,

    /// Prefix of minted session keys (`scope:sender:epoch`).
    #[serde(default = "default_session_scope")]
    pub session_scope: String,

    /// Minimum interval between partial card updates while streaming.
    #[serde(default = "default_stream_throttle_ms")]
    pub stream_throttle_ms: u64,

    /// Interval of the cache sweep.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Directory where inbound media is downloaded.
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    /// Extra system prompt sent ahead of every user turn.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Whether to teach the backend the media marker protocol and run the
    /// post-processing pipeline.
    #[serde(default = "default_true")]
    pub enable_media_markers: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session_timeout_secs: default_session_timeout_secs(),
            session_max_age_secs: default_session_max_age_secs(),
            session_scope: default_session_scope(),
            stream_throttle_ms: default_stream_throttle_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            media_dir: default_media_dir(),
            system_prompt: None,
            enable_media_markers: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_timeout_secs() -> u64 {
    30 * 60
}

fn default_session_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_session_scope() -> String {
    "dingtalk".to_string()
}

fn default_stream_throttle_ms() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_media_dir() -> String {
    dirs::data_dir()
        .map(|p| p.join("dingflow").join("media"))
        .unwrap_or_else(|| std::path::PathBuf::from("media"))
        .to_string_lossy()
        .into_owned()
}

fn default_true() -> bool {
    true
}

/// Completion backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Base URL; `/v1/chat/completions` is appended.
    #[serde(default = "default_gateway_url")]
    pub base_url: String,

    /// Bearer token for the backend. `None` sends no Authorization header.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Model name sent in every request.
    #[serde(default = "default_gateway_model")]
    pub model: String,

    /// Upper bound for one streamed completion.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_url(),
            auth_token: None,
            model: default_gateway_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:18789".to_string()
}

fn default_gateway_model() -> String {
    "default".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

/// Messaging provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DingTalkConfig {
    /// Base URL of the new-style REST API.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Base URL of the legacy API (media upload).
    #[serde(default = "default_oapi_base")]
    pub oapi_base: String,

    /// AI card template used for streaming replies.
    #[serde(default = "default_card_template_id")]
    pub card_template_id: String,

    /// Stream replies into an AI card. When `false` every reply is batched.
    #[serde(default = "default_true")]
    pub card_enabled: bool,

    /// Robot accounts, one stream connection each.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for DingTalkConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            oapi_base: default_oapi_base(),
            card_template_id: default_card_template_id(),
            card_enabled: true,
            accounts: Vec::new(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.dingtalk.com".to_string()
}

fn default_oapi_base() -> String {
    "https://oapi.dingtalk.com".to_string()
}

fn default_card_template_id() -> String {
    DEFAULT_CARD_TEMPLATE_ID.to_string()
}

/// A single robot account.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    /// Local identifier, part of every surface target key.
    #[serde(default = "default_account_id")]
    pub id: String,

    /// App key of the robot application.
    pub client_id: String,

    /// App secret of the robot application.
    pub client_secret: String,

    /// Robot code; the provider uses the app key when unset.
    #[serde(default)]
    pub robot_code: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-account card template override.
    #[serde(default)]
    pub card_template_id: Option<String>,
}

impl AccountConfig {
    pub fn robot_code(&self) -> &str {
        self.robot_code.as_deref().unwrap_or(&self.client_id)
    }
}

fn default_account_id() -> String {
    "default".to_string()
}

/// Retry/backoff configuration for transient remote failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}
