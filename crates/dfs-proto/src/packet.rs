//! Packet framing for block data.
//!
//! A packet is a payload chunk of at most the configured maximum size plus a
//! CRC32C checksum. Three framings exist, all little-endian:
//!
//! | format             | layout                                              |
//! |--------------------|-----------------------------------------------------|
//! | `Default`          | `len:u32 crc:u32 is_last:u8 seq:i64 payload`        |
//! | `NoSequenceNumber` | `len:u32 crc:u32 is_last:u8 payload`                |
//! | `ChecksumOnly`     | `crc:u32 payload` (length supplied by the reader)   |

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Default maximum payload size of one packet (64 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// Raw value written in place of a length or status field to abort a stream.
pub const ABORT_SENTINEL: u32 = 0xFFFF_FFFF;

/// Size of the stored checksum preceding each payload on disk.
pub const CHECKSUM_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    /// Client to first node, and node to node.
    Default,
    /// Node to reading client.
    NoSequenceNumber,
    /// Local disk and the replication read path.
    ChecksumOnly,
}

impl PacketFormat {
    /// Bytes preceding the payload.
    pub const fn header_len(self) -> usize {
        match self {
            PacketFormat::Default => 4 + 4 + 1 + 8,
            PacketFormat::NoSequenceNumber => 4 + 4 + 1,
            PacketFormat::ChecksumOnly => CHECKSUM_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: i64,
    pub is_last: bool,
    pub checksum: u32,
    pub data: Bytes,
}

impl Packet {
    /// Build a packet and compute its checksum.
    pub fn new(sequence: i64, data: impl Into<Bytes>, is_last: bool) -> Self {
        let data = data.into();
        Self {
            sequence,
            is_last,
            checksum: crc32c::crc32c(&data),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn verify(&self) -> Result<(), ProtoError> {
        let actual = crc32c::crc32c(&self.data);
        if actual != self.checksum {
            return Err(ProtoError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Append this packet in the given framing.
    pub fn encode(&self, format: PacketFormat, buf: &mut BytesMut) {
        buf.reserve(format.header_len() + self.data.len());
        if format != PacketFormat::ChecksumOnly {
            buf.put_u32_le(self.data.len() as u32);
        }
        buf.put_u32_le(self.checksum);
        match format {
            PacketFormat::Default => {
                buf.put_u8(self.is_last as u8);
                buf.put_i64_le(self.sequence);
            }
            PacketFormat::NoSequenceNumber => buf.put_u8(self.is_last as u8),
            PacketFormat::ChecksumOnly => {}
        }
        buf.put_slice(&self.data);
    }
}

/// Reads and writes packets under a fixed maximum payload size.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Read a length-carrying packet (`Default` or `NoSequenceNumber`).
    ///
    /// Every packet other than the last must be exactly the maximum size.
    pub async fn read_framed<R>(
        &self,
        r: &mut R,
        format: PacketFormat,
        verify: bool,
    ) -> Result<Packet, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        if format == PacketFormat::ChecksumOnly {
            return Err(ProtoError::InvalidPacket(
                "checksum-only packets carry no length".into(),
            ));
        }

        let len = r.read_u32_le().await?;
        if len == ABORT_SENTINEL {
            return Err(ProtoError::PeerAborted);
        }
        let len = len as usize;
        if len > self.max_packet_size {
            return Err(ProtoError::InvalidPacket(format!(
                "length {} exceeds maximum {}",
                len, self.max_packet_size
            )));
        }

        let checksum = r.read_u32_le().await?;
        let is_last = match r.read_u8().await? {
            0 => false,
            1 => true,
            other => {
                return Err(ProtoError::InvalidPacket(format!(
                    "bad is_last flag {}",
                    other
                )))
            }
        };
        let sequence = if format == PacketFormat::Default {
            r.read_i64_le().await?
        } else {
            0
        };
        if !is_last && len != self.max_packet_size {
            return Err(ProtoError::InvalidPacket(format!(
                "non-last packet of {} bytes, expected {}",
                len, self.max_packet_size
            )));
        }

        let data = read_payload(r, len).await?;
        let packet = Packet {
            sequence,
            is_last,
            checksum,
            data,
        };
        if verify {
            packet.verify()?;
        }
        Ok(packet)
    }

    /// Read a `ChecksumOnly` packet whose payload length the caller knows.
    pub async fn read_stored<R>(
        &self,
        r: &mut R,
        len: usize,
        is_last: bool,
        verify: bool,
    ) -> Result<Packet, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        if len > self.max_packet_size {
            return Err(ProtoError::InvalidPacket(format!(
                "length {} exceeds maximum {}",
                len, self.max_packet_size
            )));
        }
        let checksum = r.read_u32_le().await?;
        let data = read_payload(r, len).await?;
        let packet = Packet {
            sequence: 0,
            is_last,
            checksum,
            data,
        };
        if verify {
            packet.verify()?;
        }
        Ok(packet)
    }

    /// Write one packet. Empty `ChecksumOnly` packets are not written at all.
    pub async fn write<W>(
        &self,
        w: &mut W,
        packet: &Packet,
        format: PacketFormat,
    ) -> Result<(), ProtoError>
    where
        W: AsyncWrite + Unpin,
    {
        if format == PacketFormat::ChecksumOnly && packet.is_empty() {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        packet.encode(format, &mut buf);
        w.write_all(&buf).await?;
        Ok(())
    }
}

async fn read_payload<R>(r: &mut R, len: usize) -> Result<Bytes, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut data = BytesMut::zeroed(len);
    r.read_exact(&mut data).await?;
    Ok(data.freeze())
}

/// Write the abort sentinel in place of the next frame or status.
pub async fn write_abort<W>(w: &mut W) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    w.write_u32_le(ABORT_SENTINEL).await?;
    w.flush().await?;
    Ok(())
}
