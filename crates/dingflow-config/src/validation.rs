// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-deserialization validation for configuration values.

use std::collections::HashSet;

use crate::diagnostic::ConfigError;
use crate::model::DingflowConfig;

/// Lower bound for the partial-update throttle.
const MIN_THROTTLE_MS: u64 = 50;

/// Validate a deserialized configuration for semantic correctness.
///
/// Collects every failure instead of stopping at the first one.
pub fn validate_config(config: &DingflowConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ConfigError::Validation { message });

    for (key, url) in [
        ("gateway.base_url", &config.gateway.base_url),
        ("dingtalk.api_base", &config.dingtalk.api_base),
        ("dingtalk.oapi_base", &config.dingtalk.oapi_base),
    ] {
        if !looks_like_http_url(url) {
            push(format!("{key} `{url}` must be an http(s) URL"));
        }
    }

    if config.bridge.stream_throttle_ms < MIN_THROTTLE_MS {
        push(format!(
            "bridge.stream_throttle_ms must be at least {MIN_THROTTLE_MS}, got {}",
            config.bridge.stream_throttle_ms
        ));
    }

    if config.bridge.session_timeout_secs == 0 {
        push("bridge.session_timeout_secs must be greater than zero".to_string());
    }

    if config.bridge.session_scope.trim().is_empty() || config.bridge.session_scope.contains(':')
    {
        push("bridge.session_scope must be non-empty and must not contain `:`".to_string());
    }

    if config.bridge.cleanup_interval_secs == 0 {
        push("bridge.cleanup_interval_secs must be greater than zero".to_string());
    }

    if config.retry.max_attempts == 0 {
        push("retry.max_attempts must be at least 1".to_string());
    }

    if config.retry.base_delay_ms > config.retry.max_delay_ms {
        push(format!(
            "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
            config.retry.base_delay_ms, config.retry.max_delay_ms
        ));
    }

    let mut seen_ids = HashSet::new();
    for (i, account) in config.dingtalk.accounts.iter().enumerate() {
        if account.id.trim().is_empty() {
            push(format!("dingtalk.accounts[{i}].id must not be empty"));
        } else if !seen_ids.insert(account.id.as_str()) {
            push(format!("duplicate account id `{}` in [[dingtalk.accounts]]", account.id));
        }
        if account.client_id.trim().is_empty() {
            push(format!("dingtalk.accounts[{i}].client_id must not be empty"));
        }
        if account.client_secret.trim().is_empty() {
            push(format!("dingtalk.accounts[{i}].client_secret must not be empty"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Checks that at least one account will connect. Only required for `serve`.
pub fn validate_serving(config: &DingflowConfig) -> Result<(), Vec<ConfigError>> {
    if config.enabled_accounts().next().is_none() {
        return Err(vec![ConfigError::MissingKey {
            key: "dingtalk.accounts".to_string(),
        }]);
    }
    Ok(())
}

fn looks_like_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    matches!(rest, Some(host) if !host.is_empty() && !host.contains(char::is_whitespace))
}
