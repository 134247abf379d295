//! TCP front end of the data server.
//!
//! Every connection carries exactly one request: a framed
//! [`DataServerHeader`] followed by the write, read or log exchange.

use std::net::SocketAddr;
use std::sync::Arc;

use dfs_config::ConfigManager;
use dfs_proto::{
    write_abort, write_status, ClientProtocolResult, DataServerHeader, Packet, PacketCodec,
    PacketFormat, ProtoError,
};
use dfs_types::{BlockId, CoordinatorCode, ServerAddress, Status, StatusCode};
use dfs_utils::file_utils;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::block_sender::{BlockSender, ServerStatus};
use crate::block_store::BlockStore;
use crate::config::DataServerConfig;
use crate::error::{DataServerError, DataServerResult};

pub struct BlockServer {
    store: Arc<BlockStore>,
    config: Arc<ConfigManager<DataServerConfig>>,
    codec: PacketCodec,
    advertised: ServerAddress,
}

impl BlockServer {
    pub fn new(
        store: Arc<BlockStore>,
        config: Arc<ConfigManager<DataServerConfig>>,
        advertised: ServerAddress,
    ) -> Self {
        let codec = PacketCodec::new(store.layout().packet_size() as usize);
        Self {
            store,
            config,
            codec,
            advertised,
        }
    }

    pub fn advertised_address(&self) -> &ServerAddress {
        &self.advertised
    }

    /// Accept connections until `shutdown` flips, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let local = listener.local_addr().ok();
        info!(addr = ?local, advertised = %self.advertised, "block server listening");

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("block server shutdown signal received");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tasks.spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                // Reap finished connections so the set does not grow.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        tasks.shutdown().await;
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let header = match DataServerHeader::read_from(&mut stream).await {
            Ok(h) => h,
            Err(e) => {
                warn!(%peer, error = %e, "failed to read request header");
                return;
            }
        };
        let kind = header.kind_name();
        debug!(%peer, request = kind, "request received");

        let result = match header {
            DataServerHeader::WriteBlock { block_id, chain } => {
                self.handle_write(&mut stream, block_id, chain).await
            }
            DataServerHeader::ReadBlock {
                block_id,
                offset,
                size,
            } => self.handle_read(&mut stream, block_id, offset, size).await,
            DataServerHeader::GetLogFileContents { max_size } => {
                self.handle_get_log(&mut stream, max_size).await
            }
        };

        match result {
            Ok(()) => {
                let _ = stream.shutdown().await;
            }
            Err(e) if e.is_disconnect() => debug!(%peer, request = kind, "peer disconnected"),
            Err(e) => warn!(%peer, request = kind, error = %e, "request failed"),
        }
    }

    // -----------------------------------------------------------------------
    // WriteBlock
    // -----------------------------------------------------------------------

    async fn handle_write(
        &self,
        stream: &mut TcpStream,
        block_id: BlockId,
        chain: Vec<ServerAddress>,
    ) -> DataServerResult<()> {
        if chain.first() != Some(&self.advertised) {
            write_status(stream, ClientProtocolResult::Error).await?;
            return Err(DataServerError::Chain(format!(
                "{} is not the head of chain {:?}",
                self.advertised, chain
            )));
        }

        // Blocks may only land in a directory whose owning file system is known.
        if self.store.file_system_id().is_none() {
            write_status(stream, ClientProtocolResult::Error).await?;
            return Err(DataServerError::Status(Status::with_message(
                CoordinatorCode::NOT_REGISTERED,
                format!("refusing block {} before registration", block_id),
            )));
        }

        let file = match self.store.add_new_block(block_id).await {
            Ok(f) => f,
            Err(e) => {
                write_status(stream, ClientProtocolResult::Error).await?;
                return Err(e.into());
            }
        };

        let mut sender = match BlockSender::open(block_id, &chain[1..], self.codec).await {
            Ok(s) => s,
            Err(e) => {
                drop(file);
                self.store.remove_block_if_pending(block_id).await;
                write_status(stream, ClientProtocolResult::Error).await?;
                return Err(e);
            }
        };
        write_status(stream, ClientProtocolResult::Ok).await?;

        let mut file = BufWriter::new(file);
        let size = match self
            .receive_packets(stream, &mut file, &mut sender, block_id)
            .await
        {
            Ok(size) => size,
            Err(e) => {
                sender.cancel().await;
                drop(file);
                self.store.remove_block_if_pending(block_id).await;
                if !e.is_disconnect() {
                    let _ = write_abort(stream).await;
                    let linger = self.config.get().error_linger;
                    tokio::time::sleep(linger).await;
                }
                return Err(e);
            }
        };

        match self.finish_write(file, &mut sender, block_id, size).await {
            Ok(()) => {
                write_status(stream, ClientProtocolResult::Ok).await?;
                Ok(())
            }
            Err(e) => {
                sender.cancel().await;
                self.store.remove_block_if_pending(block_id).await;
                write_status(stream, ClientProtocolResult::Error).await?;
                Err(e)
            }
        }
    }

    /// Persist and forward packets until the last one; returns the block size.
    async fn receive_packets(
        &self,
        stream: &mut TcpStream,
        file: &mut BufWriter<tokio::fs::File>,
        sender: &mut BlockSender,
        block_id: BlockId,
    ) -> DataServerResult<u64> {
        // Only the tail of the chain verifies checksums.
        let verify = sender.is_response_only();
        let mut expected_seq: Option<i64> = None;
        let mut size = 0u64;

        loop {
            let packet = self
                .codec
                .read_framed(stream, PacketFormat::Default, verify)
                .await?;
            if let Some(expected) = expected_seq {
                if packet.sequence != expected {
                    return Err(DataServerError::SequenceMismatch {
                        expected,
                        actual: packet.sequence,
                    });
                }
            }
            expected_seq = Some(packet.sequence + 1);

            self.codec
                .write(file, &packet, PacketFormat::ChecksumOnly)
                .await?;
            sender.send_packet(&packet).await?;
            if sender.server_status() == ServerStatus::Error {
                return Err(DataServerError::Chain(format!(
                    "downstream of block {} failed",
                    block_id
                )));
            }
            size += packet.len() as u64;
            write_status(stream, ClientProtocolResult::Ok).await?;

            if packet.is_last {
                return Ok(size);
            }
        }
    }

    async fn finish_write(
        &self,
        mut file: BufWriter<tokio::fs::File>,
        sender: &mut BlockSender,
        block_id: BlockId,
        size: u64,
    ) -> DataServerResult<()> {
        file.flush().await?;
        file.into_inner().sync_all().await?;

        if sender.wait_for_acknowledgements().await == ServerStatus::Error {
            return Err(DataServerError::Chain(format!(
                "downstream did not commit block {}",
                block_id
            )));
        }
        self.store.complete_block(block_id, size).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ReadBlock
    // -----------------------------------------------------------------------

    async fn handle_read(
        &self,
        stream: &mut TcpStream,
        block_id: BlockId,
        offset: i64,
        size: i64,
    ) -> DataServerResult<()> {
        let (file, block_size) = match self.store.open_block(block_id).await {
            Ok(v) => v,
            Err(e) => {
                write_status(stream, ClientProtocolResult::Error).await?;
                debug!(%block_id, error = %e, "read of unavailable block");
                return Ok(());
            }
        };

        let Some((start, end)) = resolve_range(offset, size, block_size) else {
            write_status(stream, ClientProtocolResult::OutOfRange).await?;
            debug!(%block_id, offset, size, block_size, "read out of range");
            return Ok(());
        };

        let layout = self.store.layout();
        let aligned = if start < end {
            layout.align_down(start)
        } else {
            start
        };
        write_status(stream, ClientProtocolResult::Ok).await?;
        stream.write_i64_le(aligned as i64).await?;

        let mut file = file;
        file.seek(std::io::SeekFrom::Start(layout.file_offset(aligned)))
            .await?;
        let mut reader = BufReader::new(file);

        let result = self
            .send_range(stream, &mut reader, aligned, end, block_size)
            .await;
        match result {
            Ok(()) => Ok(()),
            // The client may stop reading whenever it has what it needs.
            Err(e) if e.is_disconnect() => {
                debug!(%block_id, "reader went away");
                Ok(())
            }
            Err(e) => {
                warn!(%block_id, error = %e, "aborting block read");
                let _ = write_abort(stream).await;
                Err(e)
            }
        }
    }

    async fn send_range(
        &self,
        stream: &mut TcpStream,
        reader: &mut BufReader<tokio::fs::File>,
        start: u64,
        end: u64,
        block_size: u64,
    ) -> DataServerResult<()> {
        let layout = self.store.layout();
        if start >= end {
            let empty = Packet::new(0, bytes::Bytes::new(), true);
            self.codec
                .write(stream, &empty, PacketFormat::NoSequenceNumber)
                .await?;
            stream.flush().await?;
            return Ok(());
        }

        let mut pos = start;
        while pos < end {
            let len = layout.packet_len_at(pos, block_size);
            let is_last = pos + len >= end;
            let packet = self
                .codec
                .read_stored(reader, len as usize, is_last, true)
                .await
                .map_err(stored_read_error)?;
            self.codec
                .write(stream, &packet, PacketFormat::NoSequenceNumber)
                .await?;
            pos += len;
        }
        stream.flush().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // GetLogFileContents
    // -----------------------------------------------------------------------

    async fn handle_get_log(&self, stream: &mut TcpStream, max_size: i32) -> DataServerResult<()> {
        let log = self.config.get().log.clone();
        let Some(path) = dfs_logging::current_log_file(&log) else {
            write_status(stream, ClientProtocolResult::Error).await?;
            return Ok(());
        };

        let max = max_size.max(0) as u64;
        let tail = tokio::task::spawn_blocking(move || file_utils::read_tail(&path, max))
            .await
            .map_err(|e| Status::with_message(StatusCode::FOUND_BUG, format!("log reader: {}", e)))?;
        let contents = match tail {
            Ok(c) => c,
            Err(e) => {
                write_status(stream, ClientProtocolResult::Error).await?;
                return Err(e.into());
            }
        };

        write_status(stream, ClientProtocolResult::Ok).await?;
        stream.write_all(&contents).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Resolve a requested range against the block size.
///
/// A negative `size` means "to the end of the block". Returns `None` when
/// the range falls outside the block.
pub fn resolve_range(offset: i64, size: i64, block_size: u64) -> Option<(u64, u64)> {
    let block_size = i64::try_from(block_size).ok()?;
    if offset < 0 || offset > block_size {
        return None;
    }
    let end = if size < 0 {
        block_size
    } else {
        offset.checked_add(size)?
    };
    if end > block_size {
        return None;
    }
    Some((offset as u64, end as u64))
}

/// A stored record that cannot be read back is corruption, not a disconnect.
fn stored_read_error(e: ProtoError) -> DataServerError {
    match e {
        ProtoError::ConnectionClosed => DataServerError::Proto(ProtoError::InvalidPacket(
            "block file ends inside a record".into(),
        )),
        other => DataServerError::Proto(other),
    }
}
