//! Console client for alumchat.xyz.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use alumchat_core::Config;

mod app;

#[derive(Parser)]
#[command(name = "alumchat", version, about = "Console XMPP client for alumchat.xyz")]
struct Cli {
    /// Alternate configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };

    app::App::new(config).run().await
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("ALUMCHAT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
