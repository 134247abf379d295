/// Status code type alias.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const INVALID_ARG: status_code_t = 3;
    pub const IO_ERROR: status_code_t = 69;
    pub const FOUND_BUG: status_code_t = 998;
}

/// Network status codes (2xxx).
pub mod RPCCode {
    use super::status_code_t;

    pub const TIMEOUT: status_code_t = 2005;
    pub const SEND_FAILED: status_code_t = 2007;
    pub const LISTEN_FAILED: status_code_t = 2011;
    pub const CONNECT_FAILED: status_code_t = 2014;
}

/// Data server (block store and block protocol) status codes (4xxx).
pub mod DataServerCode {
    use super::status_code_t;

    pub const BLOCK_ALREADY_EXISTS: status_code_t = 4000;
    pub const BLOCK_NOT_PENDING: status_code_t = 4001;
    pub const BLOCK_NOT_FOUND: status_code_t = 4002;
    pub const BLOCK_ALREADY_COMMITTED: status_code_t = 4003;
    pub const BLOCK_OPEN_FAILED: status_code_t = 4009;
    pub const BLOCK_WRITE_FAILED: status_code_t = 4011;
    pub const BLOCK_SIZE_MISMATCH: status_code_t = 4015;
    pub const STORE_INIT_FAILED: status_code_t = 4018;
    pub const CHAIN_ERROR: status_code_t = 4034;
}

/// Coordinator interaction status codes (5xxx).
pub mod CoordinatorCode {
    use super::status_code_t;

    pub const HEARTBEAT_FAIL: status_code_t = 5002;
    pub const FILE_SYSTEM_ID_MISMATCH: status_code_t = 5003;
    pub const INVALID_RESPONSE: status_code_t = 5004;
    pub const NOT_REGISTERED: status_code_t = 5005;
}

/// Whether a failure with this code must bring down the whole process rather
/// than a single connection.
pub fn is_fatal(code: status_code_t) -> bool {
    matches!(
        code,
        CoordinatorCode::FILE_SYSTEM_ID_MISMATCH | DataServerCode::STORE_INIT_FAILED
    )
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::IO_ERROR => "IOError",
        StatusCode::FOUND_BUG => "FoundBug",

        // RPC
        RPCCode::TIMEOUT => "RPC::Timeout",
        RPCCode::SEND_FAILED => "RPC::SendFailed",
        RPCCode::LISTEN_FAILED => "RPC::ListenFailed",
        RPCCode::CONNECT_FAILED => "RPC::ConnectFailed",

        // DataServer
        DataServerCode::BLOCK_ALREADY_EXISTS => "DataServer::BlockAlreadyExists",
        DataServerCode::BLOCK_NOT_PENDING => "DataServer::BlockNotPending",
        DataServerCode::BLOCK_NOT_FOUND => "DataServer::BlockNotFound",
        DataServerCode::BLOCK_ALREADY_COMMITTED => "DataServer::BlockAlreadyCommitted",
        DataServerCode::BLOCK_OPEN_FAILED => "DataServer::BlockOpenFailed",
        DataServerCode::BLOCK_WRITE_FAILED => "DataServer::BlockWriteFailed",
        DataServerCode::BLOCK_SIZE_MISMATCH => "DataServer::BlockSizeMismatch",
        DataServerCode::STORE_INIT_FAILED => "DataServer::StoreInitFailed",
        DataServerCode::CHAIN_ERROR => "DataServer::ChainError",

        // Coordinator
        CoordinatorCode::HEARTBEAT_FAIL => "Coordinator::HeartbeatFail",
        CoordinatorCode::FILE_SYSTEM_ID_MISMATCH => "Coordinator::FileSystemIdMismatch",
        CoordinatorCode::INVALID_RESPONSE => "Coordinator::InvalidResponse",
        CoordinatorCode::NOT_REGISTERED => "Coordinator::NotRegistered",

        _ => "UnknownStatusCode",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::OK, 0);
        assert_eq!(StatusCode::FOUND_BUG, 998);
        assert_eq!(RPCCode::TIMEOUT, 2005);
        assert_eq!(DataServerCode::BLOCK_ALREADY_EXISTS, 4000);
        assert_eq!(CoordinatorCode::FILE_SYSTEM_ID_MISMATCH, 5003);
    }

    #[test]
    fn test_to_string() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(StatusCode::INVALID_ARG), "InvalidArg");
        assert_eq!(to_string(RPCCode::TIMEOUT), "RPC::Timeout");
        assert_eq!(
            to_string(DataServerCode::BLOCK_NOT_PENDING),
            "DataServer::BlockNotPending"
        );
        assert_eq!(
            to_string(CoordinatorCode::FILE_SYSTEM_ID_MISMATCH),
            "Coordinator::FileSystemIdMismatch"
        );
        assert_eq!(to_string(12345), "UnknownStatusCode");
    }

    #[test]
    fn test_is_fatal() {
        assert!(is_fatal(CoordinatorCode::FILE_SYSTEM_ID_MISMATCH));
        assert!(is_fatal(DataServerCode::STORE_INIT_FAILED));
        assert!(!is_fatal(DataServerCode::BLOCK_ALREADY_EXISTS));
        assert!(!is_fatal(RPCCode::CONNECT_FAILED));
    }
}
