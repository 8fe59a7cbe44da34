//! Granule discovery CLI
//!
//! Runs one discovery pass from a JSON config document and prints the
//! resulting batch as JSON on stdout. Logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use granule_discovery::pipeline::run_discovery;
use granule_discovery::types::config::DiscoveryConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "discover-granules")]
#[command(about = "Discover provider files and queue new or changed granules")]
struct Cli {
    /// Path to the discovery config (JSON)
    #[arg(long, short)]
    config: PathBuf,

    /// Override the maximum granules returned in the batch
    #[arg(long)]
    batch_limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,granule_discovery=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();

    let mut config = DiscoveryConfig::from_path(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(limit) = cli.batch_limit {
        config.batch_limit = limit;
    }

    let output = run_discovery(&config)
        .await
        .context("Discovery pass failed")?;

    let json = serde_json::to_string_pretty(&output).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
