//! Messages exchanged with the coordinator on every heartbeat.

use dfs_types::{BlockId, FileSystemId, ServerAddress};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Bytes held by committed blocks.
    pub used: u64,
    /// Bytes available on the volume.
    pub free: u64,
    /// Volume capacity.
    pub total: u64,
}

/// One queued report, sent in order within a heartbeat batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeartbeatData {
    InitialRegistration {
        address: ServerAddress,
        file_system_id: Option<FileSystemId>,
    },
    BlockCommitted {
        block_id: BlockId,
        size: u64,
    },
    BlockReport {
        blocks: Vec<BlockId>,
        disk: DiskUsage,
    },
    Status {
        disk: DiskUsage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub address: ServerAddress,
    pub data: Vec<HeartbeatData>,
}

/// Work order to re-stream a committed block along `data_servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAssignment {
    pub block_id: BlockId,
    pub data_servers: Vec<ServerAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataServerCommand {
    ReportBlocks,
    DeleteBlocks { block_ids: Vec<BlockId> },
    ReplicateBlock { assignment: ReplicationAssignment },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub file_system_id: FileSystemId,
    #[serde(default)]
    pub commands: Vec<DataServerCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let id = BlockId::new_random();
        let req = HeartbeatRequest {
            address: "10.0.0.5:7000".parse().unwrap(),
            data: vec![HeartbeatData::BlockCommitted {
                block_id: id,
                size: 42,
            }],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["address"], "10.0.0.5:7000");
        assert_eq!(json["data"][0]["type"], "block_committed");
        assert_eq!(json["data"][0]["block_id"], id.to_string());
    }

    #[test]
    fn test_response_without_commands() {
        let fs = FileSystemId::new_random();
        let text = format!("{{\"file_system_id\":\"{}\"}}", fs);
        let resp: HeartbeatResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(resp.file_system_id, fs);
        assert!(resp.commands.is_empty());
    }

    #[test]
    fn test_replicate_command_json() {
        let id = BlockId::new_random();
        let text = format!(
            r#"{{"type":"replicate_block","assignment":{{"block_id":"{}","data_servers":["h1:1","h2:2"]}}}}"#,
            id
        );
        let cmd: DataServerCommand = serde_json::from_str(&text).unwrap();
        match cmd {
            DataServerCommand::ReplicateBlock { assignment } => {
                assert_eq!(assignment.block_id, id);
                assert_eq!(assignment.data_servers.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
