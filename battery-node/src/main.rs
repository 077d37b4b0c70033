//! Headless replication node.
//!
//! Opens the local database, optionally joins a room, and logs replication
//! events until interrupted.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use battery_node::{Config, Event, Node};

#[derive(Parser)]
#[command(name = "battery-node")]
#[command(about = "Peer-to-peer replicated SQL node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "battery-node.toml")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "BATTERY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Database name (overrides config file)
    #[arg(long, env = "BATTERY_DB_NAME")]
    db_name: Option<String>,

    /// Signaling relay URL (overrides config file)
    #[arg(long, env = "BATTERY_SIGNALING_URL")]
    url: Option<String>,

    /// Room token (overrides config file)
    #[arg(long, env = "BATTERY_ROOM_TOKEN")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "battery_node=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        let content = std::fs::read_to_string(&cli.config)?;
        toml::from_str::<Config>(&content)?
    } else {
        info!("config file not found, using defaults");
        Config::default()
    };
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(db_name) = cli.db_name {
        config.node.db_name = db_name;
    }
    if let Some(url) = cli.url {
        config.signaling.url = Some(url);
    }
    if let Some(token) = cli.token {
        config.signaling.token = Some(token);
    }

    let signaling = config.signaling.clone();
    let node = Node::new(config);
    node.init().await?;
    info!(node_id = %node.node_id().await?, "node ready");

    let mut events = node.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::Connected) => info!("connected to room"),
                Ok(Event::Disconnected) => info!("disconnected from room"),
                Ok(Event::Reconnecting { attempt }) => info!(attempt, "reconnecting"),
                Ok(Event::Reconnected) => info!("reconnected"),
                Ok(Event::PeerJoin { peer_id }) => info!(%peer_id, "peer joined"),
                Ok(Event::PeerReady { peer_id }) => info!(%peer_id, "peer ready"),
                Ok(Event::PeerLeave { peer_id }) => info!(%peer_id, "peer left"),
                Ok(Event::Sync { count, peer_id }) => info!(count, %peer_id, "synced"),
                Ok(Event::Operation { op, from_peer }) => {
                    info!(version = %op.version(), from_peer = from_peer.as_deref(), "operation")
                }
                Ok(Event::Error { message }) => error!(%message, "node error"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    match (signaling.url, signaling.token) {
        (Some(url), Some(token)) => {
            node.connect(&url, &token).await?;
        }
        _ => info!("no signaling url/token configured; running offline"),
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.close().await?;
    Ok(())
}
