use thiserror::Error;

use crate::wire::WireError;

/// Errors raised while framing or parsing data-server traffic.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The peer closed the connection in the middle of a frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer wrote the protocol-error sentinel instead of the next frame.
    #[error("stream aborted by peer")]
    PeerAborted,

    #[error("io error: {0}")]
    Io(std::io::Error),

    /// The packet frame is structurally invalid.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A packet payload did not match its checksum.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A message header does not carry the magic number.
    #[error("invalid message: checksum low byte {0:#04x}")]
    InvalidMagic(u8),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A status slot held a value that is neither a result nor the sentinel.
    #[error("invalid status value {0}")]
    InvalidStatus(i32),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for ProtoError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::ConnectionClosed
        } else {
            ProtoError::Io(e)
        }
    }
}

impl ProtoError {
    /// True when the peer went away rather than sending bad data.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtoError::ConnectionClosed => true,
            ProtoError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
