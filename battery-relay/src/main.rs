//! Relay binary.

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser)]
#[command(name = "battery-relay")]
#[command(about = "Signaling relay for rtc-battery rooms")]
struct Cli {
    /// Port to listen on
    #[arg(default_value_t = 8081)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "battery_relay=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("binding port {}", cli.port))?;

    tokio::select! {
        result = battery_relay::run(listener) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
