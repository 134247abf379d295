//! Client side of the coordinator heartbeat.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dfs_proto::{read_message, write_message, HeartbeatRequest, HeartbeatResponse};
use dfs_types::{
    make_error_msg, CoordinatorCode, FileSystemId, RPCCode, Result, ServerAddress, Status,
};
use parking_lot::Mutex;
use tokio::net::TcpStream;

/// Channel to the cluster coordinator.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse>;
}

/// Blanket implementation: `Arc<T>` delegates to `T`.
#[async_trait]
impl<T: CoordinatorClient + ?Sized> CoordinatorClient for Arc<T> {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        (**self).heartbeat(req).await
    }
}

// ---------------------------------------------------------------------------
// TCP implementation
// ---------------------------------------------------------------------------

/// Sends each heartbeat as a framed JSON message on a fresh connection.
#[derive(Debug, Clone)]
pub struct TcpCoordinatorClient {
    address: ServerAddress,
    timeout: Duration,
}

impl TcpCoordinatorClient {
    pub fn new(address: ServerAddress, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    async fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(self.address.as_connect_target())
            .await
            .map_err(|e| {
                Status::with_message(
                    RPCCode::CONNECT_FAILED,
                    format!("connect to coordinator {}: {}", self.address, e),
                )
            })?;
        write_message(&mut stream, payload).await.map_err(|e| {
            Status::with_message(RPCCode::SEND_FAILED, format!("send heartbeat: {}", e))
        })?;
        read_message(&mut stream).await.map_err(|e| {
            Status::with_message(
                CoordinatorCode::HEARTBEAT_FAIL,
                format!("read heartbeat response: {}", e),
            )
        })
    }
}

#[async_trait]
impl CoordinatorClient for TcpCoordinatorClient {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let payload = serde_json::to_vec(&req).map_err(|e| {
            Status::with_message(CoordinatorCode::HEARTBEAT_FAIL, format!("encode: {}", e))
        })?;
        let body = match tokio::time::timeout(self.timeout, self.exchange(&payload)).await {
            Ok(r) => r?,
            Err(_) => {
                return make_error_msg(
                    RPCCode::TIMEOUT,
                    format!("heartbeat to {} timed out", self.address),
                )
            }
        };
        serde_json::from_slice(&body).map_err(|e| {
            Status::with_message(CoordinatorCode::INVALID_RESPONSE, format!("decode: {}", e))
        })
    }
}

// ---------------------------------------------------------------------------
// Mock implementation
// ---------------------------------------------------------------------------

type Handler = Box<dyn Fn(&HeartbeatRequest) -> Result<HeartbeatResponse> + Send + Sync>;

/// A configurable mock for [`CoordinatorClient`].
///
/// Records every request. Without a handler it answers with its own
/// file-system id and no commands.
pub struct MockCoordinatorClient {
    pub file_system_id: FileSystemId,
    handler: Mutex<Option<Handler>>,
    requests: Mutex<Vec<HeartbeatRequest>>,
}

impl MockCoordinatorClient {
    pub fn new(file_system_id: FileSystemId) -> Self {
        Self {
            file_system_id,
            handler: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn on_heartbeat(
        &self,
        f: impl Fn(&HeartbeatRequest) -> Result<HeartbeatResponse> + Send + Sync + 'static,
    ) {
        *self.handler.lock() = Some(Box::new(f));
    }

    pub fn requests(&self) -> Vec<HeartbeatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CoordinatorClient for MockCoordinatorClient {
    async fn heartbeat(&self, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let result = match self.handler.lock().as_ref() {
            Some(f) => f(&req),
            None => Ok(HeartbeatResponse {
                file_system_id: self.file_system_id,
                commands: Vec::new(),
            }),
        };
        self.requests.lock().push(req);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfs_proto::{DataServerCommand, HeartbeatData};
    use dfs_types::BlockId;

    fn request() -> HeartbeatRequest {
        HeartbeatRequest {
            address: ServerAddress::new("127.0.0.1", 9500),
            data: vec![],
        }
    }

    #[tokio::test]
    async fn test_mock_default_response() {
        let fs = FileSystemId::new_random();
        let mock = MockCoordinatorClient::new(fs);
        let rsp = mock.heartbeat(request()).await.unwrap();
        assert_eq!(rsp.file_system_id, fs);
        assert!(rsp.commands.is_empty());
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_custom_handler_through_arc() {
        let mock = MockCoordinatorClient::new(FileSystemId::new_random()).into_arc();
        mock.on_heartbeat(|_| make_error_msg(CoordinatorCode::HEARTBEAT_FAIL, "down"));
        let client: Arc<dyn CoordinatorClient> = mock.clone();
        let err = client.heartbeat(request()).await.unwrap_err();
        assert_eq!(err.code(), CoordinatorCode::HEARTBEAT_FAIL);
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_client_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ServerAddress::from_socket_addr(listener.local_addr().unwrap());
        let fs = FileSystemId::new_random();
        let id = BlockId::new_random();

        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let body = read_message(&mut s).await.unwrap();
            let req: HeartbeatRequest = serde_json::from_slice(&body).unwrap();
            let rsp = HeartbeatResponse {
                file_system_id: fs,
                commands: vec![DataServerCommand::DeleteBlocks { block_ids: vec![id] }],
            };
            write_message(&mut s, &serde_json::to_vec(&rsp).unwrap())
                .await
                .unwrap();
            req
        });

        let client = TcpCoordinatorClient::new(addr, Duration::from_secs(5));
        let mut req = request();
        req.data.push(HeartbeatData::BlockCommitted { block_id: id, size: 9 });
        let rsp = client.heartbeat(req.clone()).await.unwrap();
        assert_eq!(rsp.file_system_id, fs);
        assert_eq!(rsp.commands.len(), 1);
        assert_eq!(server.await.unwrap(), req);
    }

    #[tokio::test]
    async fn test_tcp_client_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ServerAddress::from_socket_addr(listener.local_addr().unwrap());
        drop(listener);
        let client = TcpCoordinatorClient::new(addr, Duration::from_secs(5));
        let err = client.heartbeat(request()).await.unwrap_err();
        assert_eq!(err.code(), RPCCode::CONNECT_FAILED);
        assert!(!err.is_fatal());
    }
}
