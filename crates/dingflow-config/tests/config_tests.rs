// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests for the Dingflow configuration system.

use dingflow_config::diagnostic::ConfigError;
use dingflow_config::model::DEFAULT_CARD_TEMPLATE_ID;
use dingflow_config::{load_and_validate_str, load_config_from_str};

#[test]
fn full_toml_deserializes() {
    let toml = r#"
[bridge]
log_level = "debug"
session_timeout_secs = 600
stream_throttle_ms = 250
system_prompt = "Answer in English."

[gateway]
base_url = "http://localhost:9000"
auth_token = "gw-token"
model = "main"

[dingtalk]
card_enabled = false

[[dingtalk.accounts]]
id = "ops"
client_id = "dingkey"
client_secret = "dingsecret"
robot_code = "robot-1"

[retry]
max_attempts = 5
"#;

    let config = load_config_from_str(toml).expect("valid TOML should deserialize");
    assert_eq!(config.bridge.log_level, "debug");
    assert_eq!(config.bridge.session_timeout_secs, 600);
    assert_eq!(config.bridge.stream_throttle_ms, 250);
    assert_eq!(
        config.bridge.system_prompt.as_deref(),
        Some("Answer in English.")
    );
    assert_eq!(config.gateway.base_url, "http://localhost:9000");
    assert_eq!(config.gateway.auth_token.as_deref(), Some("gw-token"));
    assert_eq!(config.gateway.model, "main");
    assert!(!config.dingtalk.card_enabled);
    assert_eq!(config.dingtalk.accounts.len(), 1);
    assert_eq!(config.dingtalk.accounts[0].robot_code(), "robot-1");
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, 500);
}

#[test]
fn empty_toml_uses_defaults() {
    let config = load_config_from_str("").expect("empty TOML should use defaults");
    assert_eq!(config.bridge.session_timeout_secs, 1800);
    assert_eq!(config.bridge.stream_throttle_ms, 300);
    assert_eq!(config.bridge.session_scope, "dingtalk");
    assert!(config.bridge.enable_media_markers);
    assert_eq!(config.gateway.base_url, "http://127.0.0.1:18789");
    assert!(config.gateway.auth_token.is_none());
    assert_eq!(config.dingtalk.api_base, "https://api.dingtalk.com");
    assert_eq!(config.dingtalk.card_template_id, DEFAULT_CARD_TEMPLATE_ID);
    assert!(config.dingtalk.card_enabled);
    assert!(config.dingtalk.accounts.is_empty());
}

#[test]
fn unknown_key_gets_suggestion() {
    let toml = r#"
[gateway]
modle = "main"
"#;
    let errors = load_and_validate_str(toml).expect_err("should reject unknown field");
    assert!(errors.iter().any(|e| matches!(
        e,
        ConfigError::UnknownKey { key, suggestion, .. }
            if key == "modle" && suggestion.as_deref() == Some("model")
    )));
}

#[test]
fn semantic_errors_surface_through_load() {
    let toml = r#"
[bridge]
stream_throttle_ms = 1
"#;
    let errors = load_and_validate_str(toml).expect_err("throttle too low");
    assert!(errors.iter().any(|e| matches!(
        e,
        ConfigError::Validation { message } if message.contains("stream_throttle_ms")
    )));
}
