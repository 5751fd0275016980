// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `dingflow check-config` output.

use std::fmt::Write;

use dingflow_config::DingflowConfig;

/// Human-readable summary of a validated configuration. Never contains secrets.
pub fn summary(config: &DingflowConfig) -> String {
    let mut out = String::from("configuration ok\n");
    let gateway = &config.gateway;
    let _ = writeln!(
        out,
        "gateway: {} (model {}, auth {})",
        gateway.base_url,
        gateway.model,
        if gateway.auth_token.is_some() { "set" } else { "none" }
    );
    let _ = writeln!(
        out,
        "cards: {} (template {})",
        if config.dingtalk.card_enabled { "enabled" } else { "disabled" },
        config.dingtalk.card_template_id
    );
    let _ = writeln!(
        out,
        "sessions: timeout {}s, scope {}",
        config.bridge.session_timeout_secs, config.bridge.session_scope
    );

    if config.dingtalk.accounts.is_empty() {
        out.push_str("accounts: none configured\n");
    }
    for account in &config.dingtalk.accounts {
        let _ = writeln!(
            out,
            "account {}: client {}, robot {}{}",
            account.id,
            account.client_id,
            account.robot_code(),
            if account.enabled { "" } else { " (disabled)" }
        );
    }
    out
}
