//! Relay probe
//!
//! Connects to the hub as a broadcaster, prints the contest info, and logs
//! pushed broadcast commands (acknowledging stops) until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shotcast_client::network::{BroadcastCommandHandler, ConnectErrorCallback, ConnectionState};
use shotcast_client::{BroadcasterIdentity, ClientConfig, SignalingHub};

struct LoggingHandler;

#[async_trait]
impl BroadcastCommandHandler for LoggingHandler {
    async fn start_broadcast(&self, track_ids: Vec<String>) {
        tracing::info!("Relay asked to start {:?}", track_ids);
    }

    async fn stop_broadcast(&self, track_ids: Vec<String>) {
        tracing::info!("Relay asked to stop {:?}", track_ids);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shotcast_client=debug,shotcast_probe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ClientConfig::load(config_path.as_deref()).context("Failed to load config")?;

    let alias = std::env::var("SHOTCAST_ALIAS").context("SHOTCAST_ALIAS is not set")?;
    let shot_token = std::env::var("SHOTCAST_SHOT_TOKEN").unwrap_or_default();

    tracing::info!("Probing {} as {}", config.signaling.url, alias);

    let hub = SignalingHub::new(config.signaling.clone());
    let on_error: ConnectErrorCallback = Arc::new(|e| tracing::warn!("Connect failed: {}", e));
    let channel = hub
        .connect(BroadcasterIdentity::new(alias, shot_token), Some(on_error))
        .await;

    let handler: Arc<dyn BroadcastCommandHandler> = Arc::new(LoggingHandler);
    channel.set_command_handler(&handler);

    tokio::select! {
        connected = channel.wait_for_state(ConnectionState::Connected) => { connected?; }
        _ = tokio::signal::ctrl_c() => {
            hub.reset().await;
            return Ok(());
        }
    }

    let info = channel.get_contest_info().await?;
    println!("Contest: {}", info.contest.title.resolve("en").unwrap_or("-"));
    println!("  starts: {}", info.contest.start_at);
    println!("  ends:   {}", info.contest.end_at());
    if let Some(user) = &info.user {
        println!("  user:   {} ({})", user.name.resolve("en").unwrap_or("-"), user.id);
    }
    println!("  socket: {}", channel.socket_id().unwrap_or_default());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    hub.reset().await;
    Ok(())
}
