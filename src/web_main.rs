use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

use sshdeck_lib::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "sshdeck-web", version, about = "sshdeck session server")]
struct Args {
    /// Server config file (default: <config_dir>/sshdeck/server.toml)
    #[arg(long, env = "SSHDECK_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overrides host/port from the config
    #[arg(long)]
    bind: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Server entry point for sshdeck
///
/// Serves the event channel and the profile API; the router and the
/// per-socket orchestrators live in the library crate.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    sshdeck_lib::init_logging(&args.log_level);

    let config = ServerConfig::load(args.config.as_deref()).context("Failed to load server config")?;
    let bind = args.bind.unwrap_or_else(|| config.bind_address());

    sshdeck_lib::server::serve(&config, &bind).await
}
