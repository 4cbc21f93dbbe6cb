use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tracing::{info, warn};

mod chat_sender;
mod commands;
mod config;
mod delivery;
mod formatter;
mod processor;
mod scheduler;
mod store;
mod ts_client;
mod utils;
mod webhook;

use chat_sender::TelegramChatSender;
use config::Config;
use processor::EventProcessor;
use store::Store;
use ts_client::HttpTicketInfoClient;

const SWEEPER_INTERVAL: Duration = Duration::from_secs(60);
const SWEEPER_GRACE_PERIOD_SECS: i64 = 60;

/// Resolves on SIGINT, SIGTERM, or SIGQUIT (§5 "Cancellation and timeouts").
/// Non-Unix targets fall back to Ctrl+C alone.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = unix_signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut quit = unix_signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory") {
            warn!("Failed to load .env file: {}", e);
        }
    }

    utils::setup_logging()?;
    info!("Starting otrs-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("failed to load configuration")?;
    info!("Configuration loaded successfully");

    let store = Arc::new(
        Store::new(&config.store.database_path, config.store.max_connections)
            .await
            .context("store initialization failed")?,
    );

    let ts_client = Arc::new(HttpTicketInfoClient::new(&config.ts)?);
    let chat_sender = Arc::new(TelegramChatSender::new(config.chat.token.clone()));

    let processor = EventProcessor::new(
        store.clone(),
        ts_client,
        chat_sender.clone(),
        config.scheduler.default_interval_secs,
    );

    let timer_handle = {
        let store = store.clone();
        let processor = processor.clone();
        let default_interval = config.scheduler.default_interval_secs;
        tokio::spawn(async move { scheduler::run_timer(store, processor, default_interval).await })
    };

    let sweeper_handle = {
        let store = store.clone();
        let chat_sender = chat_sender.clone();
        tokio::spawn(async move {
            delivery::run_sweeper(store, chat_sender, SWEEPER_INTERVAL, SWEEPER_GRACE_PERIOD_SECS).await
        })
    };

    let bind_addr = format!("{}:{}", config.webhook.bind_addr, config.webhook.port)
        .parse()
        .context("invalid webhook bind address")?;

    let webhook_handle = {
        let processor = processor.clone();
        tokio::spawn(async move {
            webhook::serve(bind_addr, processor, shutdown_signal()).await;
        })
    };

    info!("otrs-relay is running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
        result = webhook_handle => {
            if let Err(e) = result {
                warn!("webhook task ended unexpectedly: {e}");
            }
        }
    }

    timer_handle.abort();
    sweeper_handle.abort();

    info!("otrs-relay stopped");
    Ok(())
}
