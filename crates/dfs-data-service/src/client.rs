//! Client side of the block data protocol.

use bytes::{Bytes, BytesMut};
use dfs_proto::{
    read_status, ClientProtocolResult, DataServerHeader, Packet, PacketCodec, PacketFormat,
};
use dfs_types::{BlockId, ServerAddress};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::block_sender::{BlockSender, ServerStatus};
use crate::error::{DataServerError, DataServerResult};

/// Stream `data` into a new block through `chain`, starting at `chain[0]`.
///
/// Resolves once every replica in the chain has committed the block.
pub async fn write_block(
    chain: &[ServerAddress],
    block_id: BlockId,
    data: &[u8],
    codec: PacketCodec,
) -> DataServerResult<()> {
    if chain.is_empty() {
        return Err(DataServerError::Chain("empty replica chain".into()));
    }
    let mut sender = BlockSender::open(block_id, chain, codec).await?;

    let data = Bytes::copy_from_slice(data);
    let max = codec.max_packet_size();
    let count = data.len().div_ceil(max).max(1);
    for i in 0..count {
        let start = (i * max).min(data.len());
        let end = ((i + 1) * max).min(data.len());
        let packet = Packet::new(i as i64, data.slice(start..end), i + 1 == count);
        sender.send_packet(&packet).await?;
    }

    match sender.wait_for_acknowledgements().await {
        ServerStatus::Ok => Ok(()),
        ServerStatus::Error => Err(DataServerError::Chain(format!(
            "write of block {} was not committed",
            block_id
        ))),
    }
}

/// Result of a range read: the bytes asked for and where the server's
/// packet-aligned response started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlockResponse {
    pub aligned_offset: u64,
    pub data: Bytes,
}

/// Read `size` bytes at `offset` from a block; a negative size reads to the end.
pub async fn read_block(
    server: &ServerAddress,
    block_id: BlockId,
    offset: i64,
    size: i64,
    codec: PacketCodec,
) -> DataServerResult<ReadBlockResponse> {
    let mut stream = TcpStream::connect(server.as_connect_target()).await?;
    DataServerHeader::ReadBlock {
        block_id,
        offset,
        size,
    }
    .write_to(&mut stream)
    .await?;

    match read_status(&mut stream).await? {
        ClientProtocolResult::Ok => {}
        other => return Err(DataServerError::Rejected(other)),
    }
    let aligned = stream.read_i64_le().await?;
    if aligned < 0 || aligned > offset {
        return Err(DataServerError::Chain(format!(
            "server returned start offset {} for offset {}",
            aligned, offset
        )));
    }

    let mut buf = BytesMut::new();
    loop {
        let packet = codec
            .read_framed(&mut stream, PacketFormat::NoSequenceNumber, true)
            .await?;
        buf.extend_from_slice(&packet.data);
        if packet.is_last {
            break;
        }
    }

    let skip = (offset - aligned) as usize;
    let mut data = buf.freeze();
    if skip > data.len() {
        return Err(DataServerError::Chain(format!(
            "response of {} bytes does not reach offset {}",
            data.len(),
            offset
        )));
    }
    data = data.slice(skip..);
    if size >= 0 {
        let want = size as usize;
        if data.len() < want {
            return Err(DataServerError::Chain(format!(
                "short read: {} of {} bytes",
                data.len(),
                want
            )));
        }
        data.truncate(want);
    }

    Ok(ReadBlockResponse {
        aligned_offset: aligned as u64,
        data,
    })
}

/// Fetch up to `max_size` trailing bytes of the server's current log file.
pub async fn get_log_file_contents(
    server: &ServerAddress,
    max_size: i32,
) -> DataServerResult<Vec<u8>> {
    let mut stream = TcpStream::connect(server.as_connect_target()).await?;
    DataServerHeader::GetLogFileContents { max_size }
        .write_to(&mut stream)
        .await?;
    match read_status(&mut stream).await? {
        ClientProtocolResult::Ok => {}
        other => return Err(DataServerError::Rejected(other)),
    }
    let mut contents = Vec::new();
    stream.read_to_end(&mut contents).await?;
    Ok(contents)
}
