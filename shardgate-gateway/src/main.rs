//! Shardgate gateway - Main entry point

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use shardgate_core::config::DEFAULT_CONFIG_PATH;
use shardgate_core::{GatewayConfig, KubeNodeResolver, RedisConnector};
use shardgate_gateway::Gateway;

#[derive(Parser, Debug)]
#[command(name = "shardgate")]
#[command(about = "REST gateway over consistently hashed cache shards")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    // SHARDGATE_LOG wins over the configured level
    let filter = EnvFilter::try_from_env("SHARDGATE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let resolver = KubeNodeResolver::new(&config.discovery).context("building discovery client")?;
    let connector = RedisConnector::new(
        Duration::from_millis(config.command_timeout_ms),
        Duration::from_millis(config.connect_timeout_ms),
    );

    let gateway = Gateway::start(config, &resolver, &connector)
        .await
        .context("admitting shards")?;
    gateway.run().await
}
