//! Wire formats of the block data server: message framing, packet framing,
//! the request header and status slots, and the coordinator heartbeat
//! messages.

pub mod data_server;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod packet;
pub mod wire;

pub use data_server::{
    read_status, write_status, ClientProtocolResult, DataServerHeader, PROTOCOL_ERROR_SENTINEL,
};
pub use error::ProtoError;
pub use heartbeat::{
    DataServerCommand, DiskUsage, HeartbeatData, HeartbeatRequest, HeartbeatResponse,
    ReplicationAssignment,
};
pub use message::{read_message, write_message, MessageHeader};
pub use packet::{
    write_abort, Packet, PacketCodec, PacketFormat, ABORT_SENTINEL, CHECKSUM_SIZE,
    DEFAULT_MAX_PACKET_SIZE,
};
pub use wire::{from_wire, to_wire, WireDeserialize, WireError, WireSerialize};
