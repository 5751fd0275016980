// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./dingflow.toml` > `~/.config/dingflow/dingflow.toml` >
//! `/etc/dingflow/dingflow.toml` with environment variable overrides via `DINGFLOW_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::DingflowConfig;

pub(crate) const SYSTEM_CONFIG_PATH: &str = "/etc/dingflow/dingflow.toml";
pub(crate) const LOCAL_CONFIG_PATH: &str = "dingflow.toml";

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/dingflow/dingflow.toml`
/// 3. `~/.config/dingflow/dingflow.toml`
/// 4. `./dingflow.toml`
/// 5. `DINGFLOW_*` environment variables
pub fn load_config() -> Result<DingflowConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no file lookup, no env).
pub fn load_config_from_str(toml_content: &str) -> Result<DingflowConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(DingflowConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<DingflowConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(DingflowConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Build the layered Figment before extraction.
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(DingflowConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH))
        .merge(Toml::file(user_config_path().unwrap_or_default()))
        .merge(Toml::file(LOCAL_CONFIG_PATH))
        .merge(env_provider())
}

pub(crate) fn user_config_path() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|d| d.join("dingflow").join("dingflow.toml"))
}

/// Environment provider with explicit section mapping.
///
/// Uses `Env::map()` rather than `Env::split("_")` because keys contain
/// underscores: `DINGFLOW_GATEWAY_AUTH_TOKEN` must become `gateway.auth_token`.
/// Accounts are an array and cannot be addressed from the environment.
fn env_provider() -> Env {
    Env::prefixed("DINGFLOW_").map(|key| {
        let key_str = key.as_str();
        let mapped = key_str
            .replacen("bridge_", "bridge.", 1)
            .replacen("gateway_", "gateway.", 1)
            .replacen("dingtalk_", "dingtalk.", 1)
            .replacen("retry_", "retry.", 1);
        mapped.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_nested_keys() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DINGFLOW_GATEWAY_AUTH_TOKEN", "tok-from-env");
            jail.set_env("DINGFLOW_BRIDGE_STREAM_THROTTLE_MS", "500");
            let config: DingflowConfig = Figment::new()
                .merge(Serialized::defaults(DingflowConfig::default()))
                .merge(env_provider())
                .extract()?;
            assert_eq!(config.gateway.auth_token.as_deref(), Some("tok-from-env"));
            assert_eq!(config.bridge.stream_throttle_ms, 500);
            Ok(())
        });
    }

    #[test]
    fn local_file_is_picked_up() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                LOCAL_CONFIG_PATH,
                r#"
[gateway]
model = "from-file"
"#,
            )?;
            let config: DingflowConfig = build_figment().extract()?;
            assert_eq!(config.gateway.model, "from-file");
            Ok(())
        });
    }
}
