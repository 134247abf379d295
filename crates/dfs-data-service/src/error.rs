//! Error type for the data-server connection and replication paths.

use std::time::Duration;

use dfs_proto::{ClientProtocolResult, ProtoError};
use dfs_types::Status;

#[derive(Debug, thiserror::Error)]
pub enum DataServerError {
    /// Framing or transport failure on a data connection.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// A store, lifecycle or coordination failure.
    #[error("status error: {0}")]
    Status(#[from] Status),

    /// The downstream part of a replica chain failed.
    #[error("chain error: {0}")]
    Chain(String),

    /// A packet arrived out of order.
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: i64, actual: i64 },

    /// The remote server answered with a non-Ok status.
    #[error("request rejected: {0:?}")]
    Rejected(ClientProtocolResult),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for DataServerError {
    fn from(e: std::io::Error) -> Self {
        DataServerError::Proto(e.into())
    }
}

impl DataServerError {
    /// True when the remote side simply went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DataServerError::Proto(e) if e.is_disconnect())
    }

    /// True for errors that must stop the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DataServerError::Status(s) if s.is_fatal())
    }
}

pub type DataServerResult<T> = std::result::Result<T, DataServerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_types::CoordinatorCode;

    #[test]
    fn test_io_error_becomes_proto() {
        let err: DataServerError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, DataServerError::Proto(ProtoError::Io(_))));
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_fatal_status() {
        let err: DataServerError = Status::new(CoordinatorCode::FILE_SYSTEM_ID_MISMATCH).into();
        assert!(err.is_fatal());
        let err = DataServerError::Chain("down".into());
        assert!(!err.is_fatal());
        assert!(!err.is_disconnect());
    }
}
