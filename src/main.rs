use std::path::PathBuf;

use clap::Parser;
use honfig_server::config::DEFAULT_CONFIG_PATH;
use honfig_server::{ChatIdentity, ManagerConfig, ManagerService};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fleet manager for a pool of Heroes of Newerth game-server processes.
#[derive(Parser)]
#[command(name = "honfigurator", version)]
struct Cli {
    /// Path to the manager config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Write a default config to the config path and exit.
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();

    if cli.init {
        ManagerConfig::default().save(&cli.config).await?;
        info!(path = %cli.config.display(), "wrote default config");
        return Ok(());
    }

    let config = ManagerConfig::load(&cli.config).await?;
    let identity = ChatIdentity::from_config(&config);
    let service = ManagerService::start(config, identity).await?;

    // Bring the pre-created fleet up; starts queue on the start gate.
    let manager = service.manager();
    for snapshot in manager.enumerate() {
        let manager = manager.clone();
        let id = snapshot.id;
        tokio::spawn(async move {
            if let Err(e) = manager.start_server(id).await {
                warn!(id, "failed to start instance: {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    service.shutdown().await;
    Ok(())
}
