use anyhow::{Context, Result};
use clap::Parser;
use sni_edge::{Node, NodeConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Edge node serving SNI routing, DNS-over-HTTPS and DNS-over-TLS.
///
/// Names listed in the configuration's override table are answered with
/// the configured addresses; every other query goes to the upstream
/// resolver.
#[derive(Parser, Debug)]
#[command(name = "sni-edge")]
#[command(version, about)]
struct Args {
    /// Path to the node configuration file (JSON).
    #[arg(short = 'c', long, default_value = "config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = NodeConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;

    tokio::select! {
        result = Node::new(config).run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("received ctrl-c, shutting down");
            Ok(())
        }
    }
}
