//! Background re-streaming of committed blocks to new replicas.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use dfs_config::ConfigManager;
use dfs_proto::{Packet, PacketCodec, ReplicationAssignment};
use dfs_types::StatusCode;
use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::block_sender::{BlockSender, ServerStatus};
use crate::block_store::BlockStore;
use crate::config::DataServerConfig;
use crate::error::{DataServerError, DataServerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The block is not committed here; nothing was sent.
    Skipped,
    Replicated { size: u64 },
}

pub struct ReplicationWorker {
    store: Arc<BlockStore>,
    config: Arc<ConfigManager<DataServerConfig>>,
    codec: PacketCodec,
    queue: Mutex<VecDeque<ReplicationAssignment>>,
    notify: Notify,
}

impl ReplicationWorker {
    pub fn new(store: Arc<BlockStore>, config: Arc<ConfigManager<DataServerConfig>>) -> Self {
        let codec = PacketCodec::new(store.layout().packet_size() as usize);
        Self {
            store,
            config,
            codec,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, assignment: ReplicationAssignment) {
        debug!(block_id = %assignment.block_id, "replication queued");
        self.queue.lock().push_back(assignment);
        self.notify.notify_one();
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Process assignments in FIFO order until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let next = self.queue.lock().pop_front();
            let Some(assignment) = next else {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            };

            let block_id = assignment.block_id;
            match self.replicate(&assignment).await {
                Ok(ReplicationOutcome::Skipped) => {
                    debug!(%block_id, "replication skipped, block not committed")
                }
                Ok(ReplicationOutcome::Replicated { size }) => {
                    info!(%block_id, size, targets = ?assignment.data_servers, "block replicated")
                }
                Err(e) => warn!(%block_id, error = %e, "replication failed"),
            }
        }
        debug!("replication worker stopped");
    }

    /// Stream one committed block to the assignment's chain.
    pub async fn replicate(
        &self,
        assignment: &ReplicationAssignment,
    ) -> DataServerResult<ReplicationOutcome> {
        let block_id = assignment.block_id;
        if assignment.data_servers.is_empty() {
            return Ok(ReplicationOutcome::Skipped);
        }
        // A block deleted since the command was queued is not an error.
        let (file, size) = match self.store.open_block(block_id).await {
            Ok(opened) => opened,
            Err(e) if e.code() == StatusCode::INVALID_ARG => {
                return Ok(ReplicationOutcome::Skipped)
            }
            Err(e) => return Err(e.into()),
        };
        let timeout = self.config.get().replication_timeout;
        let layout = self.store.layout();

        let mut sender = BlockSender::open(block_id, &assignment.data_servers, self.codec).await?;
        let mut reader = BufReader::new(file);

        let mut pos = 0u64;
        let mut sequence = 0i64;
        loop {
            let len = layout.packet_len_at(pos, size);
            let is_last = pos + len >= size;
            let packet = if len == 0 {
                Packet::new(sequence, Bytes::new(), true)
            } else {
                let mut p = self
                    .codec
                    .read_stored(&mut reader, len as usize, is_last, true)
                    .await?;
                p.sequence = sequence;
                p
            };

            if let Err(e) = sender.send_packet(&packet).await {
                sender.cancel().await;
                return Err(e);
            }
            if sender.server_status() == ServerStatus::Error {
                sender.cancel().await;
                return Err(DataServerError::Chain(format!(
                    "downstream failed while replicating block {}",
                    block_id
                )));
            }

            pos += len;
            sequence += 1;
            if is_last {
                break;
            }
        }

        match tokio::time::timeout(timeout, sender.wait_for_acknowledgements()).await {
            Ok(ServerStatus::Ok) => Ok(ReplicationOutcome::Replicated { size }),
            Ok(ServerStatus::Error) => Err(DataServerError::Chain(format!(
                "replica chain rejected block {}",
                block_id
            ))),
            Err(_) => {
                sender.cancel().await;
                Err(DataServerError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_server::BlockServer;
    use crate::client::{read_block, write_block};
    use dfs_types::{BlockId, FileSystemId, ServerAddress};
    use std::time::Duration;
    use tokio::net::TcpListener;

    const PACKET: usize = 16;

    struct Node {
        _dir: tempfile::TempDir,
        store: Arc<BlockStore>,
        config: Arc<ConfigManager<DataServerConfig>>,
        addr: ServerAddress,
        _shutdown: watch::Sender<bool>,
    }

    async fn start_node() -> Node {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path(), PACKET).unwrap());
        store.apply_file_system_id(FileSystemId::new_random()).unwrap();
        let config = Arc::new(ConfigManager::new(DataServerConfig {
            max_packet_size: PACKET,
            replication_timeout: Duration::from_secs(5),
            ..Default::default()
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ServerAddress::from_socket_addr(listener.local_addr().unwrap());
        let server = Arc::new(BlockServer::new(store.clone(), config.clone(), addr.clone()));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.serve(listener, rx));
        Node {
            _dir: dir,
            store,
            config,
            addr,
            _shutdown: tx,
        }
    }

    fn assignment(block_id: BlockId, data_servers: Vec<ServerAddress>) -> ReplicationAssignment {
        ReplicationAssignment {
            block_id,
            data_servers,
        }
    }

    async fn seeded_source(data: &[u8]) -> (Node, BlockId) {
        let source = start_node().await;
        let id = BlockId::new_random();
        write_block(&[source.addr.clone()], id, data, PacketCodec::new(PACKET))
            .await
            .unwrap();
        (source, id)
    }

    #[tokio::test]
    async fn test_replicate_committed_block() {
        let data: Vec<u8> = (0..45u8).collect();
        let (source, id) = seeded_source(&data).await;
        let a = start_node().await;
        let b = start_node().await;
        let worker = ReplicationWorker::new(source.store.clone(), source.config.clone());

        let outcome = worker
            .replicate(&assignment(id, vec![a.addr.clone(), b.addr.clone()]))
            .await
            .unwrap();
        assert_eq!(outcome, ReplicationOutcome::Replicated { size: 45 });

        for node in [&a, &b] {
            let rsp = read_block(&node.addr, id, 0, -1, PacketCodec::new(PACKET))
                .await
                .unwrap();
            assert_eq!(&rsp.data[..], &data[..]);
        }
    }

    #[tokio::test]
    async fn test_replicate_empty_block() {
        let (source, id) = seeded_source(&[]).await;
        let target = start_node().await;
        let worker = ReplicationWorker::new(source.store.clone(), source.config.clone());
        let outcome = worker
            .replicate(&assignment(id, vec![target.addr.clone()]))
            .await
            .unwrap();
        assert_eq!(outcome, ReplicationOutcome::Replicated { size: 0 });
        assert!(target.store.is_committed(id));
    }

    #[tokio::test]
    async fn test_uncommitted_block_is_skipped() {
        let source = start_node().await;
        let worker = ReplicationWorker::new(source.store.clone(), source.config.clone());
        let outcome = worker
            .replicate(&assignment(
                BlockId::new_random(),
                vec![ServerAddress::new("127.0.0.1", 1)],
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ReplicationOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_deleted_block_is_skipped() {
        let (source, id) = seeded_source(&[4u8; 20]).await;
        let target = start_node().await;
        source.store.delete_blocks(&[id]).await;

        let worker = ReplicationWorker::new(source.store.clone(), source.config.clone());
        let outcome = worker
            .replicate(&assignment(id, vec![target.addr.clone()]))
            .await
            .unwrap();
        assert_eq!(outcome, ReplicationOutcome::Skipped);
        assert_eq!(target.store.block_state(id), None);
    }

    #[tokio::test]
    async fn test_target_that_already_has_block_fails() {
        let (source, id) = seeded_source(&[3u8; 20]).await;
        let worker = ReplicationWorker::new(source.store.clone(), source.config.clone());
        // The source is not a valid target for its own block.
        assert!(worker
            .replicate(&assignment(id, vec![source.addr.clone()]))
            .await
            .is_err());
        assert!(source.store.is_committed(id));
    }

    #[tokio::test]
    async fn test_loop_keeps_going_after_failures() {
        let (source, id) = seeded_source(&[5u8; 33]).await;
        let target = start_node().await;
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ServerAddress::from_socket_addr(l.local_addr().unwrap())
        };

        let worker = Arc::new(ReplicationWorker::new(
            source.store.clone(),
            source.config.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(worker.clone().run(rx));

        worker.enqueue(assignment(BlockId::new_random(), vec![target.addr.clone()]));
        worker.enqueue(assignment(id, vec![dead]));
        worker.enqueue(assignment(id, vec![target.addr.clone()]));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !target.store.is_committed(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(worker.queued(), 0);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
