use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dfs_config::{Config, ConfigManager};
use dfs_data_service::{CoordinatorClient, DataServer, DataServerConfig, TcpCoordinatorClient};
use tokio::signal::unix::{signal, SignalKind};

/// Block data server
#[derive(Parser, Debug)]
#[command(name = "dfs-data-server", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "data-server.toml")]
    config: String,

    /// Dump default configuration and exit
    #[arg(long)]
    dump_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", DataServerConfig::default().render()?);
        return Ok(());
    }

    let config_exists = Path::new(&args.config).exists();
    let config = if config_exists {
        ConfigManager::load(&args.config)
            .with_context(|| format!("loading config from {}", args.config))?
    } else {
        ConfigManager::new(DataServerConfig::default())
    };
    let config = Arc::new(config);
    let cfg = config.snapshot();

    let _log_guard = dfs_logging::init_logging(&cfg.log).context("initializing logging")?;
    if !config_exists {
        tracing::warn!(path = %args.config, "config file not found, using defaults");
    }
    tracing::info!(
        config = %args.config,
        listen = %cfg.listen,
        storage_dir = %cfg.storage_dir.display(),
        "starting data server"
    );

    let coordinator: Arc<dyn CoordinatorClient> = Arc::new(TcpCoordinatorClient::new(
        cfg.coordinator_address.clone(),
        cfg.heartbeat_timeout,
    ));
    let server = DataServer::start(Arc::clone(&config), coordinator)
        .await
        .context("starting data server")?;
    tracing::info!(
        addr = %server.local_addr(),
        advertised = %server.advertised_address(),
        "data server started"
    );

    let mut sighup = signal(SignalKind::hangup()).context("registering SIGHUP handler")?;
    let reloader = Arc::clone(&config);
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            if let Err(e) = reloader.reload() {
                tracing::warn!(error = %e, "config reload failed");
            }
        }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let shutdown = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received CTRL+C"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    };

    server.run(shutdown).await.context("data server stopped")?;
    tracing::info!("data server shut down");
    Ok(())
}
