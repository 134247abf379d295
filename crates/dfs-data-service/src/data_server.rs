//! Process-level composition of the data server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use dfs_config::ConfigManager;
use dfs_types::{RPCCode, ServerAddress, Status};
use dfs_utils::BackgroundRunner;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::block_server::BlockServer;
use crate::block_store::BlockStore;
use crate::config::DataServerConfig;
use crate::coordinator::CoordinatorClient;
use crate::error::DataServerResult;
use crate::heartbeat::Heartbeater;
use crate::replication::ReplicationWorker;

/// A started data server: store opened and listener bound.
pub struct DataServer {
    config: Arc<ConfigManager<DataServerConfig>>,
    store: Arc<BlockStore>,
    server: Arc<BlockServer>,
    replication: Arc<ReplicationWorker>,
    heartbeater: Arc<Heartbeater>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl DataServer {
    /// Open the block store and bind the listener.
    pub async fn start(
        config: Arc<ConfigManager<DataServerConfig>>,
        coordinator: Arc<dyn CoordinatorClient>,
    ) -> DataServerResult<Self> {
        let cfg = config.snapshot();
        let store = Arc::new(BlockStore::open(&cfg.storage_dir, cfg.max_packet_size)?);

        let listener = TcpListener::bind(cfg.listen.as_connect_target())
            .await
            .map_err(|e| {
                Status::with_message(
                    RPCCode::LISTEN_FAILED,
                    format!("bind {}: {}", cfg.listen, e),
                )
            })?;
        let local_addr = listener.local_addr()?;

        let mut advertised = cfg.advertised_address.clone();
        if advertised.port == 0 {
            advertised.port = local_addr.port();
        }

        let server = Arc::new(BlockServer::new(
            Arc::clone(&store),
            Arc::clone(&config),
            advertised.clone(),
        ));
        let replication = Arc::new(ReplicationWorker::new(Arc::clone(&store), Arc::clone(&config)));
        let heartbeater = Arc::new(Heartbeater::new(
            advertised,
            Arc::clone(&store),
            Arc::clone(&replication),
            coordinator,
            Arc::clone(&config),
        ));

        Ok(Self {
            config,
            store,
            server,
            replication,
            heartbeater,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertised_address(&self) -> &ServerAddress {
        self.server.advertised_address()
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<ConfigManager<DataServerConfig>> {
        &self.config
    }

    /// Serve until `shutdown` resolves or a fatal error occurs, then stop
    /// every background task.
    pub async fn run<F>(self, shutdown: F) -> DataServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let DataServer {
            server,
            replication,
            heartbeater,
            listener,
            ..
        } = self;

        let mut runner = BackgroundRunner::new();
        runner.spawn("block-server", move |rx| server.serve(listener, rx));
        runner.spawn("replication", move |rx| replication.run(rx));

        let (fatal_tx, fatal_rx) = oneshot::channel::<Status>();
        runner.spawn("heartbeat", move |rx| async move {
            if let Err(e) = heartbeater.run(rx).await {
                let _ = fatal_tx.send(e);
            }
        });
        info!("data server running");

        let result = tokio::select! {
            _ = shutdown => Ok(()),
            Ok(status) = fatal_rx => {
                error!(error = %status, "stopping on fatal error");
                Err(status.into())
            }
        };

        runner.shutdown().await;
        info!("data server stopped");
        result
    }
}
