// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `dingflow serve` command implementation.
//!
//! Wires one provider client, the shared stores and one stream connection per
//! enabled account into a [`BridgeLoop`], then runs it until SIGINT or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use dingflow_agent::{BridgeLoop, DedupStore, HandlerSettings, MessageHandler, SessionStore, shutdown};
use dingflow_config::model::{AccountConfig, DingflowConfig};
use dingflow_core::{CompletionProvider, DingflowError};
use dingflow_dingtalk::{CardCache, CardEngine, DingTalkClient, DingTalkStreamClient, Messenger, TokenCache};
use dingflow_openai::GatewayProvider;
use dingflow_resilience::RetryPolicy;
use tracing::info;

/// Runs the `dingflow serve` command.
pub async fn run_serve(config: DingflowConfig) -> Result<(), DingflowError> {
    init_tracing(&config.bridge.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting dingflow serve");

    let retry = RetryPolicy::from(&config.retry);
    let client = Arc::new(DingTalkClient::new(&config.dingtalk)?);
    let tokens = Arc::new(TokenCache::new(Arc::clone(&client), retry));
    let engine = Arc::new(CardEngine::new(
        Arc::clone(&client),
        Arc::clone(&tokens),
        retry,
        config.dingtalk.card_template_id.clone(),
    ));
    let cards = Arc::new(CardCache::new(engine));
    let messenger = Messenger::new(Arc::clone(&client), tokens, retry);
    let provider: Arc<dyn CompletionProvider> = Arc::new(GatewayProvider::new(&config.gateway)?);

    let accounts: Vec<Arc<AccountConfig>> = config.enabled_accounts().cloned().map(Arc::new).collect();
    let handler = Arc::new(MessageHandler::new(
        provider,
        cards,
        messenger,
        Arc::new(SessionStore::new(config.bridge.session_scope.clone())),
        Arc::new(DedupStore::new()),
        accounts.iter().cloned(),
        HandlerSettings::from_config(&config),
    ));

    let mut bridge = BridgeLoop::new(handler, Duration::from_secs(config.bridge.cleanup_interval_secs));
    for account in accounts {
        info!(account_id = %account.id, "registering stream connection");
        bridge.add_channel(Box::new(DingTalkStreamClient::new(account, Arc::clone(&client))));
    }

    let cancel = shutdown::install_signal_handler();
    bridge.run(cancel).await?;

    info!("dingflow stopped");
    Ok(())
}

/// Initializes the tracing subscriber with an environment filter.
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dingflow={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}
