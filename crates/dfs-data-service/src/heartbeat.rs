//! Periodic exchange with the coordinator: report block state, receive work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dfs_config::ConfigManager;
use dfs_proto::{DataServerCommand, HeartbeatData, HeartbeatRequest, HeartbeatResponse};
use dfs_types::{Result, ServerAddress};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::block_store::BlockStore;
use crate::config::DataServerConfig;
use crate::coordinator::CoordinatorClient;
use crate::replication::ReplicationWorker;

pub struct Heartbeater {
    address: ServerAddress,
    store: Arc<BlockStore>,
    replication: Arc<ReplicationWorker>,
    client: Arc<dyn CoordinatorClient>,
    config: Arc<ConfigManager<DataServerConfig>>,
    registered: AtomicBool,
}

impl Heartbeater {
    pub fn new(
        address: ServerAddress,
        store: Arc<BlockStore>,
        replication: Arc<ReplicationWorker>,
        client: Arc<dyn CoordinatorClient>,
        config: Arc<ConfigManager<DataServerConfig>>,
    ) -> Self {
        Self {
            address,
            store,
            replication,
            client,
            config,
            registered: AtomicBool::new(false),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// One heartbeat exchange.
    ///
    /// Transport failures put the drained reports back for the next attempt.
    /// A file-system id mismatch is returned as a fatal status.
    pub async fn beat(&self) -> Result<()> {
        let drained = self.store.drain_heartbeats();
        let mut data = Vec::with_capacity(drained.len() + 2);
        if !self.is_registered() {
            data.push(HeartbeatData::InitialRegistration {
                address: self.address.clone(),
                file_system_id: self.store.file_system_id(),
            });
            data.push(self.block_report());
        }
        data.extend(drained.iter().cloned());
        if data.is_empty() {
            data.push(HeartbeatData::Status {
                disk: self.store.disk_usage(),
            });
        }

        let req = HeartbeatRequest {
            address: self.address.clone(),
            data,
        };
        let rsp = match self.client.heartbeat(req).await {
            Ok(rsp) => rsp,
            Err(e) => {
                self.store.requeue_heartbeats(drained);
                return Err(e);
            }
        };
        self.apply_response(rsp).await
    }

    async fn apply_response(&self, rsp: HeartbeatResponse) -> Result<()> {
        self.store.apply_file_system_id(rsp.file_system_id)?;
        if !self.registered.swap(true, Ordering::AcqRel) {
            info!(address = %self.address, file_system_id = %rsp.file_system_id, "registered with coordinator");
        }

        for command in rsp.commands {
            match command {
                DataServerCommand::ReportBlocks => {
                    debug!("coordinator requested a block report");
                    self.store.push_heartbeat(self.block_report());
                    self.store.heartbeat_notifier().notify_one();
                }
                DataServerCommand::DeleteBlocks { block_ids } => {
                    debug!(count = block_ids.len(), "coordinator requested deletion");
                    self.store.delete_blocks(&block_ids).await;
                }
                DataServerCommand::ReplicateBlock { assignment } => {
                    self.replication.enqueue(assignment);
                }
            }
        }
        Ok(())
    }

    fn block_report(&self) -> HeartbeatData {
        HeartbeatData::BlockReport {
            blocks: self.store.committed_blocks(),
            disk: self.store.disk_usage(),
        }
    }

    /// Beat every `heartbeat_interval`, or sooner when the store asks for it.
    ///
    /// Returns an error only for fatal failures.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let notify = self.store.heartbeat_notifier();
        loop {
            if let Err(e) = self.beat().await {
                if e.is_fatal() {
                    error!(error = %e, "fatal heartbeat failure");
                    return Err(e);
                }
                warn!(error = %e, "heartbeat failed");
            }

            let interval = self.config.get().heartbeat_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = notify.notified() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("heartbeat loop stopped");
        Ok(())
    }
}
