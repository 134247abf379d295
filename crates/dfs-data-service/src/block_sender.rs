//! Forwarding of a block stream to the rest of a replica chain.
//!
//! The caller's task writes packets; a spawned task drains the downstream
//! acknowledgements. The two share only an atomic status, an atomic count of
//! packets (published before the last packet is written) and a oneshot that
//! carries the final outcome.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dfs_proto::{
    read_status, ClientProtocolResult, DataServerHeader, Packet, PacketCodec, PacketFormat,
};
use dfs_types::{BlockId, ServerAddress};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DataServerError, DataServerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Ok,
    Error,
}

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;
const TOTAL_UNKNOWN: u64 = u64::MAX;

#[derive(Debug)]
struct Shared {
    status: AtomicU8,
    total_packets: AtomicU64,
}

impl Shared {
    fn status(&self) -> ServerStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_OK => ServerStatus::Ok,
            _ => ServerStatus::Error,
        }
    }

    fn set_error(&self) {
        self.status.store(STATUS_ERROR, Ordering::Release);
    }
}

pub struct BlockSender {
    block_id: BlockId,
    target: Option<ServerAddress>,
    codec: PacketCodec,
    writer: Option<OwnedWriteHalf>,
    shared: Arc<Shared>,
    done: Option<oneshot::Receiver<ServerStatus>>,
    drain: Option<JoinHandle<()>>,
    sent: u64,
}

impl std::fmt::Debug for BlockSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSender")
            .field("block_id", &self.block_id)
            .field("target", &self.target)
            .field("sent", &self.sent)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl BlockSender {
    /// Connect to `tail[0]` and announce the block with `tail` as its chain.
    ///
    /// An empty tail yields a response-only sender that performs no I/O.
    pub async fn open(
        block_id: BlockId,
        tail: &[ServerAddress],
        codec: PacketCodec,
    ) -> DataServerResult<Self> {
        let shared = Arc::new(Shared {
            status: AtomicU8::new(STATUS_OK),
            total_packets: AtomicU64::new(TOTAL_UNKNOWN),
        });

        let Some(target) = tail.first().cloned() else {
            return Ok(Self {
                block_id,
                target: None,
                codec,
                writer: None,
                shared,
                done: None,
                drain: None,
                sent: 0,
            });
        };

        let stream = TcpStream::connect(target.as_connect_target())
            .await
            .map_err(|e| DataServerError::Chain(format!("connect to {}: {}", target, e)))?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();

        let header = DataServerHeader::WriteBlock {
            block_id,
            chain: tail.to_vec(),
        };
        header.write_to(&mut writer).await?;

        let (done_tx, done_rx) = oneshot::channel();
        let drain = tokio::spawn(drain_acknowledgements(
            reader,
            Arc::clone(&shared),
            done_tx,
            block_id,
            target.clone(),
        ));
        debug!(%block_id, %target, "block sender opened");

        Ok(Self {
            block_id,
            target: Some(target),
            codec,
            writer: Some(writer),
            shared,
            done: Some(done_rx),
            drain: Some(drain),
            sent: 0,
        })
    }

    pub fn is_response_only(&self) -> bool {
        self.target.is_none()
    }

    pub fn server_status(&self) -> ServerStatus {
        self.shared.status()
    }

    /// Forward one packet in `Default` framing.
    pub async fn send_packet(&mut self, packet: &Packet) -> DataServerResult<()> {
        if self.server_status() == ServerStatus::Error {
            return Err(DataServerError::Chain(format!(
                "downstream of block {} already failed",
                self.block_id
            )));
        }
        let Some(writer) = self.writer.as_mut() else {
            if self.target.is_some() {
                return Err(DataServerError::Chain("sender was cancelled".into()));
            }
            self.sent += 1;
            return Ok(());
        };

        if packet.is_last {
            self.shared
                .total_packets
                .store(self.sent + 1, Ordering::Release);
        }
        let codec = self.codec;
        let written = async {
            codec.write(writer, packet, PacketFormat::Default).await?;
            writer.flush().await?;
            Ok::<(), DataServerError>(())
        }
        .await;
        if let Err(e) = written {
            self.shared.set_error();
            return Err(DataServerError::Chain(format!(
                "forward block {} downstream: {}",
                self.block_id, e
            )));
        }
        self.sent += 1;
        Ok(())
    }

    /// Wait until the downstream node has acknowledged every packet and its
    /// commit, or until it reports a failure.
    pub async fn wait_for_acknowledgements(&mut self) -> ServerStatus {
        if self.is_response_only() || self.server_status() == ServerStatus::Error {
            return self.server_status();
        }
        match self.done.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                self.shared.set_error();
                ServerStatus::Error
            }),
            None => self.server_status(),
        }
    }

    /// Drop the downstream connection immediately.
    pub async fn cancel(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if !self.is_response_only() {
            self.shared.set_error();
            debug!(block_id = %self.block_id, "block sender cancelled");
        }
    }
}

impl Drop for BlockSender {
    fn drop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

async fn drain_acknowledgements(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    done: oneshot::Sender<ServerStatus>,
    block_id: BlockId,
    target: ServerAddress,
) {
    let status = match read_acknowledgements(&mut reader, &shared).await {
        Ok(()) => ServerStatus::Ok,
        Err(e) => {
            warn!(%block_id, %target, error = %e, "downstream replica failed");
            shared.set_error();
            ServerStatus::Error
        }
    };
    let _ = done.send(status);
}

async fn read_acknowledgements(
    reader: &mut OwnedReadHalf,
    shared: &Shared,
) -> DataServerResult<()> {
    expect_ok(read_status(reader).await?)?;

    let mut acked = 0u64;
    loop {
        expect_ok(read_status(reader).await?)?;
        acked += 1;
        if acked == shared.total_packets.load(Ordering::Acquire) {
            break;
        }
    }

    // Final status, sent once the downstream node committed the block.
    expect_ok(read_status(reader).await?)
}

fn expect_ok(result: ClientProtocolResult) -> DataServerResult<()> {
    match result {
        ClientProtocolResult::Ok => Ok(()),
        other => Err(DataServerError::Rejected(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dfs_proto::{write_abort, write_status};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ServerAddress) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ServerAddress::from_socket_addr(l.local_addr().unwrap());
        (l, addr)
    }

    #[tokio::test]
    async fn test_response_only_sender() {
        let mut sender = BlockSender::open(BlockId::new_random(), &[], PacketCodec::new(8))
            .await
            .unwrap();
        assert!(sender.is_response_only());
        sender
            .send_packet(&Packet::new(0, Bytes::new(), true))
            .await
            .unwrap();
        assert_eq!(sender.wait_for_acknowledgements().await, ServerStatus::Ok);
    }

    #[tokio::test]
    async fn test_forwards_and_collects_acks() {
        let (l, addr) = listener().await;
        let id = BlockId::new_random();
        let codec = PacketCodec::new(4);

        let downstream = tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let header = DataServerHeader::read_from(&mut s).await.unwrap();
            write_status(&mut s, ClientProtocolResult::Ok).await.unwrap();
            let mut seqs = Vec::new();
            loop {
                let p = codec
                    .read_framed(&mut s, PacketFormat::Default, true)
                    .await
                    .unwrap();
                seqs.push(p.sequence);
                write_status(&mut s, ClientProtocolResult::Ok).await.unwrap();
                if p.is_last {
                    break;
                }
            }
            write_status(&mut s, ClientProtocolResult::Ok).await.unwrap();
            (header, seqs)
        });

        let mut sender = BlockSender::open(id, &[addr.clone()], codec).await.unwrap();
        assert!(!sender.is_response_only());
        sender.send_packet(&Packet::new(5, vec![1u8; 4], false)).await.unwrap();
        sender.send_packet(&Packet::new(6, vec![2u8; 2], true)).await.unwrap();
        assert_eq!(sender.wait_for_acknowledgements().await, ServerStatus::Ok);

        let (header, seqs) = downstream.await.unwrap();
        assert_eq!(
            header,
            DataServerHeader::WriteBlock {
                block_id: id,
                chain: vec![addr],
            }
        );
        assert_eq!(seqs, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_header_rejection_turns_status_error() {
        let (l, addr) = listener().await;
        tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let _ = DataServerHeader::read_from(&mut s).await.unwrap();
            write_status(&mut s, ClientProtocolResult::Error).await.unwrap();
        });

        let mut sender = BlockSender::open(BlockId::new_random(), &[addr], PacketCodec::new(4))
            .await
            .unwrap();
        assert_eq!(sender.wait_for_acknowledgements().await, ServerStatus::Error);
        assert_eq!(sender.server_status(), ServerStatus::Error);
        assert!(sender
            .send_packet(&Packet::new(0, Bytes::new(), true))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sentinel_mid_stream() {
        let (l, addr) = listener().await;
        let codec = PacketCodec::new(4);
        tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let _ = DataServerHeader::read_from(&mut s).await.unwrap();
            write_status(&mut s, ClientProtocolResult::Ok).await.unwrap();
            let _ = codec.read_framed(&mut s, PacketFormat::Default, false).await;
            write_abort(&mut s).await.unwrap();
        });

        let mut sender = BlockSender::open(BlockId::new_random(), &[addr], codec)
            .await
            .unwrap();
        sender.send_packet(&Packet::new(0, vec![0u8; 4], false)).await.unwrap();
        assert_eq!(sender.wait_for_acknowledgements().await, ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (l, addr) = listener().await;
        drop(l);
        let err = BlockSender::open(BlockId::new_random(), &[addr], PacketCodec::new(4))
            .await
            .unwrap_err();
        assert!(matches!(err, DataServerError::Chain(_)));
    }

    #[tokio::test]
    async fn test_cancel() {
        let (l, addr) = listener().await;
        let closed = tokio::spawn(async move {
            let (mut s, _) = l.accept().await.unwrap();
            let _ = DataServerHeader::read_from(&mut s).await.unwrap();
            let mut buf = [0u8; 1];
            // EOF once the sender shuts down its half.
            tokio::io::AsyncReadExt::read(&mut s, &mut buf).await.unwrap()
        });

        let mut sender = BlockSender::open(BlockId::new_random(), &[addr], PacketCodec::new(4))
            .await
            .unwrap();
        sender.cancel().await;
        assert_eq!(sender.server_status(), ServerStatus::Error);
        assert_eq!(closed.await.unwrap(), 0);
    }
}
