use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = <cli::Cli as clap::Parser>::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run) {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            let cfg = config::DaemonConfig::default();
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::Identity => {
            let cfg = config::load(&config_path)?;
            let storage = vnet_core::storage::Storage::open(&cfg.node.storage_path)
                .context("failed to open node storage")?;
            let identity = storage
                .load_or_create_identity()
                .context("failed to load identity")?;
            println!("{}", identity.address());
            println!("{}", identity.encode_public());
            Ok(())
        }
        cli::Command::Run => {
            let cfg = config::load(&config_path)?;
            let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
            runtime::run_node(cfg, stop_rx, Box::new(|m| tracing::info!("{m}"))).await
        }
    }
}
