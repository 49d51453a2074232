//! Meshrelay - relays a Meshtastic radio mesh into Matrix rooms
//!
//! Wires the radio supervisor, the chat supervisor, the identity store and
//! the router together, then runs until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meshrelay_core::{AsyncBridge, RelayConfig};
use meshrelay_matrix::ChatSupervisor;
use meshrelay_radio::RadioSupervisor;
use meshrelay_router::{RelayService, Router};
use meshrelay_state::MessageIdentityStore;

#[derive(Parser, Debug)]
#[command(name = "meshrelay")]
#[command(about = "Relay between a Meshtastic radio mesh and Matrix rooms")]
struct Args {
    /// Configuration file
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    /// Clear stored message mappings before starting
    #[arg(long)]
    wipe_db: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config, args.verbose)?;

    info!(
        meshnet = %config.radio.meshnet_name,
        transport = %config.radio.connection_type,
        rooms = config.rooms.len(),
        "Starting meshrelay"
    );
    let config = Arc::new(config);

    let store = MessageIdentityStore::open(&config.database.path)
        .await
        .with_context(|| format!("opening {}", config.database.path.display()))?;
    if config.database.wipe_on_restart {
        let removed = store.wipe().await?;
        info!(removed, "Cleared message mappings");
    }

    let bridge = Arc::new(AsyncBridge::start(tokio::runtime::Handle::current()));

    let chat = ChatSupervisor::new(Arc::clone(&config))?;
    chat.start().await.context("chat login failed")?;
    let chat_inbound = chat.take_inbound();
    chat.spawn_sync_loop();

    let radio = RadioSupervisor::new(Arc::clone(&config), Arc::clone(&bridge))?;
    let radio_inbound = radio.take_inbound();
    radio.connect(false).await.context("radio connection failed")?;
    radio.spawn_health_check();

    let router = Router::new(
        Arc::clone(&config),
        radio.clone(),
        chat.clone(),
        store.clone(),
        Arc::clone(&bridge),
    )
    .with_bindings(chat.bindings());
    let (mut service, handle) = RelayService::new(router);
    if let Some(rx) = radio_inbound {
        service.attach_radio(rx);
    }
    if let Some(rx) = chat_inbound {
        service.attach_chat(rx);
    }
    let service_task = tokio::spawn(service.run());

    info!("Relay running, press Ctrl+C to stop");
    wait_for_signal().await;

    info!("Shutting down");
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Relay service already stopped");
    }
    match service_task.await {
        Ok(Err(e)) => error!(error = %e, "Relay service failed"),
        Err(e) => error!(error = %e, "Relay service task panicked"),
        Ok(Ok(())) => {}
    }
    chat.shutdown();
    radio.shutdown().await;
    bridge.shutdown();
    store.close().await;
    info!("Stopped");

    Ok(())
}

/// Load the configuration file and apply command-line overrides
fn load_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = RelayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.wipe_db {
        config.database.wipe_on_restart = true;
    }
    Ok(config)
}

fn log_filter(config: &RelayConfig, verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
}

fn init_logging(config: &RelayConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = log_filter(config, verbose);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
}
