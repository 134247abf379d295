use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Network address of a data server: a host name (or IP literal) and a port.
///
/// Replica chains are lists of these, and a node recognises itself in a chain
/// by comparing against its own advertised `ServerAddress`, so equality is
/// exact on both the host string and the port.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Create a new address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build an address from a resolved socket address.
    pub fn from_socket_addr(sa: SocketAddr) -> Self {
        Self::new(sa.ip().to_string(), sa.port())
    }

    /// Return the `(host, port)` pair accepted by `tokio::net::TcpStream::connect`.
    pub fn as_connect_target(&self) -> (&str, u16) {
        let host = self
            .host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host);
        (host, self.port)
    }
}

impl fmt::Debug for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = AddressParseError;

    /// Parse an address string like `"node-07:9001"` or `"[::1]:9001"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            return Err(AddressParseError::MissingHost);
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Ok(ServerAddress::new(host, port))
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerAddress> for String {
    fn from(addr: ServerAddress) -> Self {
        addr.to_string()
    }
}

/// Errors when parsing a `ServerAddress` from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing host")]
    MissingHost,
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
}
