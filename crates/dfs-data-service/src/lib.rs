//! Block data server.
//!
//! Holds immutable blocks on local disk and takes part in chain replication:
//! a write enters at the head of a replica chain, is persisted and forwarded
//! packet by packet, and is committed on every node before the writer is
//! acknowledged. The coordinator is reached through a periodic heartbeat that
//! carries block reports out and delete/replicate commands back.

pub mod block_sender;
pub mod block_server;
pub mod block_store;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod data_server;
pub mod error;
pub mod heartbeat;
pub mod replication;

pub use block_sender::{BlockSender, ServerStatus};
pub use block_server::BlockServer;
pub use block_store::{BlockLayout, BlockState, BlockStore};
pub use config::DataServerConfig;
pub use coordinator::{CoordinatorClient, MockCoordinatorClient, TcpCoordinatorClient};
pub use data_server::DataServer;
pub use error::{DataServerError, DataServerResult};
pub use heartbeat::Heartbeater;
pub use replication::{ReplicationOutcome, ReplicationWorker};
