use std::fmt;

use crate::status_code::{self, status_code_t, StatusCode};

/// A status value carrying a code and optional message.
///
/// The `#[must_use]` attribute ensures callers do not silently ignore error
/// statuses.
#[derive(Debug, Clone)]
#[must_use]
pub struct Status {
    code: status_code_t,
    message: Option<String>,
}

impl Status {
    /// Create a status with just a code.
    pub fn new(code: status_code_t) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create a status with a code and a descriptive message.
    pub fn with_message(code: status_code_t, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(msg.into()),
        }
    }

    /// Return the numeric status code.
    pub fn code(&self) -> status_code_t {
        self.code
    }

    /// Return the optional message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether this status represents success (code == OK).
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::OK
    }

    /// Whether this status must terminate the process.
    pub fn is_fatal(&self) -> bool {
        status_code::is_fatal(self.code)
    }

    /// Produce a human-readable description like
    /// `"DataServer::BlockNotFound(4002) block 3f25... is not committed"`.
    pub fn describe(&self) -> String {
        let name = status_code::to_string(self.code);
        match &self.message {
            Some(msg) => format!("{}({}) {}", name, self.code, msg),
            None => format!("{}({})", name, self.code),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::error::Error for Status {}

impl From<status_code_t> for Status {
    fn from(code: status_code_t) -> Self {
        Self::new(code)
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        Self::with_message(StatusCode::IO_ERROR, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_code::{CoordinatorCode, DataServerCode, RPCCode};

    #[test]
    fn test_status_ok() {
        let s = Status::new(StatusCode::OK);
        assert!(s.is_ok());
        assert_eq!(s.code(), 0);
        assert!(s.message().is_none());
        assert_eq!(s.describe(), "OK(0)");
    }

    #[test]
    fn test_status_with_message() {
        let s = Status::with_message(DataServerCode::BLOCK_NOT_FOUND, "block missing");
        assert!(!s.is_ok());
        assert_eq!(s.code(), 4002);
        assert_eq!(s.message(), Some("block missing"));
        assert_eq!(s.describe(), "DataServer::BlockNotFound(4002) block missing");
    }

    #[test]
    fn test_status_display() {
        let s = Status::new(RPCCode::TIMEOUT);
        assert_eq!(format!("{}", s), "RPC::Timeout(2005)");
    }

    #[test]
    fn test_status_from_code() {
        let s: Status = StatusCode::INVALID_ARG.into();
        assert_eq!(s.code(), 3);
    }

    #[test]
    fn test_status_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let s: Status = io.into();
        assert_eq!(s.code(), StatusCode::IO_ERROR);
        assert!(s.message().unwrap().contains("denied"));
    }

    #[test]
    fn test_status_fatal() {
        assert!(Status::new(CoordinatorCode::FILE_SYSTEM_ID_MISMATCH).is_fatal());
        assert!(!Status::new(DataServerCode::CHAIN_ERROR).is_fatal());
    }
}
