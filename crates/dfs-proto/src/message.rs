use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Size of the message header in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Magic number identifying a framed message (occupies the low byte of `checksum`).
pub const MESSAGE_MAGIC_NUM: u8 = 0x86;

/// Maximum allowed message size (64 MiB).
pub const MESSAGE_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Header prepended to every framed message: 4-byte checksum followed by the
/// 4-byte payload size, both little-endian.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub checksum: u32,
    pub size: u32,
}

impl MessageHeader {
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            checksum: calc_message_checksum(payload),
            size: payload.len() as u32,
        }
    }

    /// The magic occupies the whole low byte.
    pub fn has_magic(&self) -> bool {
        (self.checksum & 0xFF) == MESSAGE_MAGIC_NUM as u32
    }

    pub fn from_bytes(data: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        let checksum = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        Self { checksum, size }
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut buf = [0u8; MESSAGE_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Checks the magic and size before the payload is read.
    pub fn check_prelude(&self) -> Result<(), ProtoError> {
        if !self.has_magic() {
            return Err(ProtoError::InvalidMagic((self.checksum & 0xFF) as u8));
        }
        let size = self.size as usize;
        if size > MESSAGE_MAX_SIZE {
            return Err(ProtoError::MessageTooLarge {
                size,
                max: MESSAGE_MAX_SIZE,
            });
        }
        Ok(())
    }

    pub fn validate(&self, payload: &[u8]) -> Result<(), ProtoError> {
        self.check_prelude()?;
        let expected = calc_message_checksum(payload);
        if self.checksum != expected {
            return Err(ProtoError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            });
        }
        Ok(())
    }
}

/// CRC32C over `data` with the low byte replaced by the magic number.
pub fn calc_message_checksum(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    (crc & !0xff) | MESSAGE_MAGIC_NUM as u32
}

/// Write one framed message and flush.
pub async fn write_message<W>(w: &mut W, payload: &[u8]) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let header = MessageHeader::for_payload(payload);
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one framed message and return its validated payload.
pub async fn read_message<R>(r: &mut R) -> Result<Vec<u8>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; MESSAGE_HEADER_SIZE];
    r.read_exact(&mut raw).await?;
    let header = MessageHeader::from_bytes(&raw);
    header.check_prelude()?;

    let mut payload = vec![0u8; header.size as usize];
    r.read_exact(&mut payload).await?;
    header.validate(&payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let hdr = MessageHeader {
            checksum: 0xAABB_CC86,
            size: 1024,
        };
        assert_eq!(MessageHeader::from_bytes(&hdr.to_bytes()), hdr);
        assert_eq!(std::mem::size_of::<MessageHeader>(), MESSAGE_HEADER_SIZE);

        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let hdr = MessageHeader::from_bytes(&data);
        assert_eq!(hdr.checksum, 0x04030201);
        assert_eq!(hdr.size, 0x08070605);
    }

    #[test]
    fn test_checksum_magic() {
        let checksum = calc_message_checksum(b"hello world");
        assert_eq!(checksum & 0xff, MESSAGE_MAGIC_NUM as u32);
    }

    #[tokio::test]
    async fn test_compressed_flag_rejected() {
        let payload = b"hello world";
        let mut hdr = MessageHeader::for_payload(payload);
        hdr.checksum |= 1;
        let mut frame = hdr.to_bytes().to_vec();
        frame.extend_from_slice(payload);
        let mut r = &frame[..];
        assert!(matches!(
            read_message(&mut r).await,
            Err(ProtoError::InvalidMagic(0x87))
        ));
    }

    #[test]
    fn test_validate_bad_magic() {
        let hdr = MessageHeader {
            checksum: 0x1234_5678,
            size: 5,
        };
        assert!(matches!(
            hdr.validate(b"12345"),
            Err(ProtoError::InvalidMagic(0x78))
        ));
    }

    #[test]
    fn test_validate_bad_checksum() {
        let payload = b"some data";
        let mut hdr = MessageHeader::for_payload(payload);
        hdr.checksum ^= 0xFF00_0000;
        assert!(matches!(
            hdr.validate(payload),
            Err(ProtoError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_too_large() {
        let hdr = MessageHeader {
            checksum: MESSAGE_MAGIC_NUM as u32,
            size: (MESSAGE_MAX_SIZE + 1) as u32,
        };
        assert!(matches!(
            hdr.check_prelude(),
            Err(ProtoError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_message() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, b"payload").await.unwrap();
        write_message(&mut a, b"").await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap(), b"payload");
        assert!(read_message(&mut b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_message_truncated() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let header = MessageHeader::for_payload(b"0123456789");
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(b"0123").await.unwrap();
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(ProtoError::ConnectionClosed)
        ));
    }
}
