use anyhow::{Context, Result};
use clap::Parser;
use muhtar::config::LogSettings;
use muhtar::{Application, Settings};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "muhtar", version, about = "Reverse-proxy API gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    init_tracing(&settings.log);
    info!(config = %cli.config.display(), "starting muhtar gateway");

    let app = Application::new(settings)
        .await
        .context("failed to bootstrap")?;
    app.run().await?;

    Ok(())
}

fn init_tracing(log: &LogSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    if log.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
