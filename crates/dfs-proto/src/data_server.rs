//! Request header and status slots of the block data protocol.

use dfs_types::{BlockId, ServerAddress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;
use crate::message::{read_message, write_message};
use crate::packet::ABORT_SENTINEL;
use crate::wire::{from_wire, to_wire, WireDeserialize, WireError, WireSerialize};

/// Result code carried in every status slot of a response.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocolResult {
    Ok = 0,
    Error = 1,
    OutOfRange = 2,
}

impl ClientProtocolResult {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::Error),
            2 => Some(Self::OutOfRange),
            _ => None,
        }
    }
}

/// Raw `-1` written instead of a status when a stream is aborted.
pub const PROTOCOL_ERROR_SENTINEL: i32 = ABORT_SENTINEL as i32;

pub async fn write_status<W>(w: &mut W, status: ClientProtocolResult) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    w.write_i32_le(status as i32).await?;
    w.flush().await?;
    Ok(())
}

/// Read one status slot. The sentinel surfaces as [`ProtoError::PeerAborted`].
pub async fn read_status<R>(r: &mut R) -> Result<ClientProtocolResult, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let v = r.read_i32_le().await?;
    if v == PROTOCOL_ERROR_SENTINEL {
        return Err(ProtoError::PeerAborted);
    }
    ClientProtocolResult::from_i32(v).ok_or(ProtoError::InvalidStatus(v))
}

const KIND_WRITE_BLOCK: u8 = 1;
const KIND_READ_BLOCK: u8 = 2;
const KIND_GET_LOG_FILE_CONTENTS: u8 = 3;

/// First message on every data-server connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataServerHeader {
    /// Stream a new block; `chain[0]` must be the receiving node.
    WriteBlock {
        block_id: BlockId,
        chain: Vec<ServerAddress>,
    },
    /// Read `size` bytes from `offset`; a negative size reads to the end.
    ReadBlock {
        block_id: BlockId,
        offset: i64,
        size: i64,
    },
    GetLogFileContents { max_size: i32 },
}

impl WireSerialize for DataServerHeader {
    fn wire_serialize(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        match self {
            DataServerHeader::WriteBlock { block_id, chain } => {
                KIND_WRITE_BLOCK.wire_serialize(buf)?;
                block_id.wire_serialize(buf)?;
                chain.wire_serialize(buf)
            }
            DataServerHeader::ReadBlock {
                block_id,
                offset,
                size,
            } => {
                KIND_READ_BLOCK.wire_serialize(buf)?;
                block_id.wire_serialize(buf)?;
                offset.wire_serialize(buf)?;
                size.wire_serialize(buf)
            }
            DataServerHeader::GetLogFileContents { max_size } => {
                KIND_GET_LOG_FILE_CONTENTS.wire_serialize(buf)?;
                max_size.wire_serialize(buf)
            }
        }
    }
}

impl WireDeserialize for DataServerHeader {
    fn wire_deserialize(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        match u8::wire_deserialize(buf, offset)? {
            KIND_WRITE_BLOCK => Ok(DataServerHeader::WriteBlock {
                block_id: BlockId::wire_deserialize(buf, offset)?,
                chain: Vec::wire_deserialize(buf, offset)?,
            }),
            KIND_READ_BLOCK => Ok(DataServerHeader::ReadBlock {
                block_id: BlockId::wire_deserialize(buf, offset)?,
                offset: i64::wire_deserialize(buf, offset)?,
                size: i64::wire_deserialize(buf, offset)?,
            }),
            KIND_GET_LOG_FILE_CONTENTS => Ok(DataServerHeader::GetLogFileContents {
                max_size: i32::wire_deserialize(buf, offset)?,
            }),
            other => Err(WireError::InvalidEnumVariant {
                enum_name: "DataServerHeader",
                value: other as u64,
            }),
        }
    }
}

impl DataServerHeader {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DataServerHeader::WriteBlock { .. } => "WriteBlock",
            DataServerHeader::ReadBlock { .. } => "ReadBlock",
            DataServerHeader::GetLogFileContents { .. } => "GetLogFileContents",
        }
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), ProtoError>
    where
        W: AsyncWrite + Unpin,
    {
        let payload = to_wire(self)?;
        write_message(w, &payload).await
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        let payload = read_message(r).await?;
        Ok(from_wire(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_values() {
        assert_eq!(ClientProtocolResult::Ok as i32, 0);
        assert_eq!(ClientProtocolResult::Error as i32, 1);
        assert_eq!(ClientProtocolResult::OutOfRange as i32, 2);
        assert_eq!(PROTOCOL_ERROR_SENTINEL, -1);
        assert_eq!(ClientProtocolResult::from_i32(3), None);
    }

    #[tokio::test]
    async fn test_status_slots() {
        let mut buf = Vec::new();
        write_status(&mut buf, ClientProtocolResult::OutOfRange).await.unwrap();
        buf.extend_from_slice(&(-1i32).to_le_bytes());
        buf.extend_from_slice(&7i32.to_le_bytes());

        let mut r = &buf[..];
        assert_eq!(
            read_status(&mut r).await.unwrap(),
            ClientProtocolResult::OutOfRange
        );
        assert!(matches!(read_status(&mut r).await, Err(ProtoError::PeerAborted)));
        assert!(matches!(
            read_status(&mut r).await,
            Err(ProtoError::InvalidStatus(7))
        ));
    }

    #[test]
    fn test_write_block_layout() {
        let id = BlockId::new_random();
        let header = DataServerHeader::WriteBlock {
            block_id: id,
            chain: vec!["a:1".parse().unwrap()],
        };
        let buf = to_wire(&header).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..17], &id.to_bytes());
        assert_eq!(&buf[17..21], &1u32.to_le_bytes());
        assert_eq!(from_wire::<DataServerHeader>(&buf).unwrap(), header);
    }

    #[tokio::test]
    async fn test_header_over_stream() {
        let headers = vec![
            DataServerHeader::ReadBlock {
                block_id: BlockId::new_random(),
                offset: 128,
                size: -1,
            },
            DataServerHeader::GetLogFileContents { max_size: 4096 },
        ];
        let (mut a, mut b) = tokio::io::duplex(1024);
        for h in &headers {
            h.write_to(&mut a).await.unwrap();
        }
        for h in &headers {
            assert_eq!(&DataServerHeader::read_from(&mut b).await.unwrap(), h);
        }
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!(
            from_wire::<DataServerHeader>(&[9]),
            Err(WireError::InvalidEnumVariant { value: 9, .. })
        ));
    }
}
