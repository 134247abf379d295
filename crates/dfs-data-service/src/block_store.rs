//! On-disk block storage and the pending/committed lifecycle.
//!
//! Layout under the storage directory:
//!
//! - `<dir>/<block-uuid>`: committed blocks
//! - `<dir>/temp/<block-uuid>`: blocks still being written
//! - `<dir>/fsid`: the file-system instance this directory belongs to
//!
//! Block files hold the packets of a block in checksum-only framing, so a
//! file is a sequence of `[crc:u32][payload]` records where every payload but
//! the last is exactly the packet size.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dfs_proto::{DiskUsage, HeartbeatData, CHECKSUM_SIZE};
use dfs_types::{
    make_error_msg, BlockId, CoordinatorCode, DataServerCode, FileSystemId, Result, Status,
    StatusCode,
};
use dfs_utils::file_utils;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub const FSID_FILE_NAME: &str = "fsid";
pub const TEMP_DIR_NAME: &str = "temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Pending,
    Committed { size: u64 },
}

/// Maps data offsets of a block to positions in its stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    packet_size: u64,
}

impl BlockLayout {
    pub fn new(packet_size: usize) -> Self {
        Self {
            packet_size: packet_size as u64,
        }
    }

    pub fn packet_size(&self) -> u64 {
        self.packet_size
    }

    fn stride(&self) -> u64 {
        self.packet_size + CHECKSUM_SIZE as u64
    }

    /// Data size of a stored file, or `None` if the length cannot come from
    /// whole records.
    pub fn data_size(&self, file_len: u64) -> Option<u64> {
        let full = file_len / self.stride();
        let rem = file_len % self.stride();
        match rem {
            0 => Some(full * self.packet_size),
            r if r <= CHECKSUM_SIZE as u64 => None,
            r => Some(full * self.packet_size + r - CHECKSUM_SIZE as u64),
        }
    }

    /// Stored file length for `data_size` bytes of data.
    pub fn stored_len(&self, data_size: u64) -> u64 {
        data_size + CHECKSUM_SIZE as u64 * data_size.div_ceil(self.packet_size)
    }

    /// Round a data offset down to the start of its packet.
    pub fn align_down(&self, offset: u64) -> u64 {
        offset / self.packet_size * self.packet_size
    }

    /// File position of the record starting at a packet-aligned data offset.
    pub fn file_offset(&self, aligned_offset: u64) -> u64 {
        aligned_offset / self.packet_size * self.stride()
    }

    /// Payload length of the record starting at `offset` in a block of `size` bytes.
    pub fn packet_len_at(&self, offset: u64, size: u64) -> u64 {
        self.packet_size.min(size.saturating_sub(offset))
    }
}

pub struct BlockStore {
    dir: PathBuf,
    temp_dir: PathBuf,
    layout: BlockLayout,
    blocks: DashMap<BlockId, BlockState>,
    file_system_id: Mutex<Option<FileSystemId>>,
    outbox: Mutex<Vec<HeartbeatData>>,
    heartbeat_notify: Arc<Notify>,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("dir", &self.dir)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

fn init_error(msg: impl Into<String>) -> Status {
    Status::with_message(DataServerCode::STORE_INIT_FAILED, msg)
}

impl BlockStore {
    /// Open a storage directory, recovering committed blocks from its files.
    ///
    /// Leftover pending files are removed. A directory that holds blocks but
    /// no `fsid` file is refused.
    pub fn open(dir: impl Into<PathBuf>, packet_size: usize) -> Result<Self> {
        let dir = dir.into();
        let temp_dir = dir.join(TEMP_DIR_NAME);
        let layout = BlockLayout::new(packet_size);

        std::fs::create_dir_all(&temp_dir)
            .map_err(|e| init_error(format!("create {}: {}", temp_dir.display(), e)))?;

        let fsid_path = dir.join(FSID_FILE_NAME);
        let file_system_id = if fsid_path.exists() {
            let text = file_utils::read_file(&fsid_path)?;
            let id = text.trim().parse::<FileSystemId>().map_err(|e| {
                init_error(format!("bad fsid file {}: {}", fsid_path.display(), e))
            })?;
            Some(id)
        } else {
            None
        };

        let blocks = DashMap::new();
        let mut block_files = 0usize;
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| init_error(format!("scan {}: {}", dir.display(), e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| init_error(format!("scan {}: {}", dir.display(), e)))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == FSID_FILE_NAME || name == TEMP_DIR_NAME {
                continue;
            }
            let Ok(block_id) = name.parse::<BlockId>() else {
                warn!(file = %name, "ignoring unexpected file in storage directory");
                continue;
            };
            let meta = entry
                .metadata()
                .map_err(|e| init_error(format!("stat {}: {}", name, e)))?;
            if !meta.is_file() {
                warn!(file = %name, "ignoring non-file entry in storage directory");
                continue;
            }
            block_files += 1;
            match layout.data_size(meta.len()) {
                Some(size) => {
                    blocks.insert(block_id, BlockState::Committed { size });
                }
                None => {
                    warn!(%block_id, file_len = meta.len(), "ignoring block file with truncated record");
                }
            }
        }

        let temp_entries = std::fs::read_dir(&temp_dir)
            .map_err(|e| init_error(format!("scan {}: {}", temp_dir.display(), e)))?;
        for entry in temp_entries.flatten() {
            let path = entry.path();
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed leftover pending block"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove leftover pending block"),
            }
        }

        if file_system_id.is_none() && block_files > 0 {
            return Err(init_error(format!(
                "{} holds {} block files but no {} file",
                dir.display(),
                block_files,
                FSID_FILE_NAME
            )));
        }

        info!(
            dir = %dir.display(),
            committed = blocks.len(),
            file_system_id = ?file_system_id,
            "block store opened"
        );

        Ok(Self {
            dir,
            temp_dir,
            layout,
            blocks,
            file_system_id: Mutex::new(file_system_id),
            outbox: Mutex::new(Vec::new()),
            heartbeat_notify: Arc::new(Notify::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn block_path(&self, block_id: BlockId) -> PathBuf {
        self.dir.join(block_id.to_string())
    }

    pub fn temp_path(&self, block_id: BlockId) -> PathBuf {
        self.temp_dir.join(block_id.to_string())
    }

    // ---------------------------------------------------------------------
    // File system identity
    // ---------------------------------------------------------------------

    pub fn file_system_id(&self) -> Option<FileSystemId> {
        *self.file_system_id.lock()
    }

    /// Adopt the coordinator's file-system id, or verify it matches the one
    /// already recorded.
    pub fn apply_file_system_id(&self, id: FileSystemId) -> Result<()> {
        let mut current = self.file_system_id.lock();
        match *current {
            Some(existing) if existing == id => Ok(()),
            Some(existing) => make_error_msg(
                CoordinatorCode::FILE_SYSTEM_ID_MISMATCH,
                format!(
                    "storage directory belongs to {}, coordinator reports {}",
                    existing, id
                ),
            ),
            None => {
                file_utils::atomic_write(&self.dir.join(FSID_FILE_NAME), id.to_string().as_bytes())?;
                *current = Some(id);
                info!(file_system_id = %id, "initialised storage directory");
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------------
    // Block state transitions
    // ---------------------------------------------------------------------

    fn try_begin(&self, block_id: BlockId) -> Result<()> {
        match self.blocks.entry(block_id) {
            Entry::Occupied(e) => {
                let code = match e.get() {
                    BlockState::Pending => DataServerCode::BLOCK_ALREADY_EXISTS,
                    BlockState::Committed { .. } => DataServerCode::BLOCK_ALREADY_COMMITTED,
                };
                make_error_msg(code, format!("block {} already known", block_id))
            }
            Entry::Vacant(e) => {
                e.insert(BlockState::Pending);
                Ok(())
            }
        }
    }

    fn try_complete(&self, block_id: BlockId, size: u64) -> Result<()> {
        match self.blocks.get_mut(&block_id) {
            Some(mut state) if *state == BlockState::Pending => {
                *state = BlockState::Committed { size };
                Ok(())
            }
            _ => make_error_msg(
                DataServerCode::BLOCK_NOT_PENDING,
                format!("block {} is not pending", block_id),
            ),
        }
    }

    fn remove_if_pending(&self, block_id: BlockId) -> bool {
        self.blocks
            .remove_if(&block_id, |_, state| *state == BlockState::Pending)
            .is_some()
    }

    pub fn block_state(&self, block_id: BlockId) -> Option<BlockState> {
        self.blocks.get(&block_id).map(|s| *s)
    }

    pub fn is_committed(&self, block_id: BlockId) -> bool {
        matches!(self.block_state(block_id), Some(BlockState::Committed { .. }))
    }

    pub fn committed_blocks(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|e| matches!(e.value(), BlockState::Committed { .. }))
            .map(|e| *e.key())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Mark `block_id` pending and create its temporary file.
    pub async fn add_new_block(&self, block_id: BlockId) -> Result<tokio::fs::File> {
        self.try_begin(block_id)?;
        let path = self.temp_path(block_id);
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await;
        match opened {
            Ok(file) => {
                debug!(%block_id, "pending block created");
                Ok(file)
            }
            Err(e) => {
                self.remove_if_pending(block_id);
                make_error_msg(
                    DataServerCode::BLOCK_OPEN_FAILED,
                    format!("create {}: {}", path.display(), e),
                )
            }
        }
    }

    /// Publish a fully written pending block and queue its report.
    pub async fn complete_block(&self, block_id: BlockId, size: u64) -> Result<()> {
        if self.block_state(block_id) != Some(BlockState::Pending) {
            return make_error_msg(
                DataServerCode::BLOCK_NOT_PENDING,
                format!("block {} is not pending", block_id),
            );
        }

        let temp = self.temp_path(block_id);
        let file_len = tokio::fs::metadata(&temp).await?.len();
        if file_len != self.layout.stored_len(size) {
            return make_error_msg(
                DataServerCode::BLOCK_SIZE_MISMATCH,
                format!(
                    "block {}: {} stored bytes do not hold {} data bytes",
                    block_id, file_len, size
                ),
            );
        }

        tokio::fs::rename(&temp, self.block_path(block_id))
            .await
            .map_err(|e| {
                Status::with_message(
                    DataServerCode::BLOCK_WRITE_FAILED,
                    format!("commit block {}: {}", block_id, e),
                )
            })?;
        self.try_complete(block_id, size)?;

        info!(%block_id, size, "block committed");
        self.push_heartbeat(HeartbeatData::BlockCommitted { block_id, size });
        self.heartbeat_notify.notify_one();
        Ok(())
    }

    /// Drop a pending block and its temporary file. No-op for any other state.
    pub async fn remove_block_if_pending(&self, block_id: BlockId) {
        if self.block_state(block_id) != Some(BlockState::Pending) {
            return;
        }
        // Unlink while the entry still reserves the id.
        let path = self.temp_path(block_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(%block_id, error = %e, "failed to remove pending block file"),
        }
        if self.remove_if_pending(block_id) {
            debug!(%block_id, "pending block removed");
        }
    }

    /// Open a committed block for reading, returning it with its size.
    pub async fn open_block(&self, block_id: BlockId) -> Result<(tokio::fs::File, u64)> {
        let size = match self.block_state(block_id) {
            Some(BlockState::Committed { size }) => size,
            _ => {
                return make_error_msg(
                    StatusCode::INVALID_ARG,
                    format!("block {} is not committed", block_id),
                )
            }
        };
        let file = tokio::fs::File::open(self.block_path(block_id))
            .await
            .map_err(|e| {
                Status::with_message(
                    DataServerCode::BLOCK_OPEN_FAILED,
                    format!("open block {}: {}", block_id, e),
                )
            })?;
        Ok((file, size))
    }

    /// Remove committed blocks on the coordinator's request.
    pub async fn delete_blocks(&self, block_ids: &[BlockId]) {
        for &block_id in block_ids {
            let removed = self
                .blocks
                .remove_if(&block_id, |_, s| matches!(s, BlockState::Committed { .. }));
            if removed.is_none() {
                debug!(%block_id, "delete requested for block that is not committed");
                continue;
            }
            match tokio::fs::remove_file(self.block_path(block_id)).await {
                Ok(()) => info!(%block_id, "block deleted"),
                Err(e) => warn!(%block_id, error = %e, "failed to delete block file"),
            }
        }
        self.push_heartbeat(HeartbeatData::Status {
            disk: self.disk_usage(),
        });
    }

    pub fn disk_usage(&self) -> DiskUsage {
        let used = self
            .blocks
            .iter()
            .filter_map(|e| match e.value() {
                BlockState::Committed { size } => Some(self.layout.stored_len(*size)),
                BlockState::Pending => None,
            })
            .sum();
        let free = fs2::available_space(&self.dir).unwrap_or_else(|e| {
            warn!(error = %e, "failed to query free space");
            0
        });
        let total = fs2::total_space(&self.dir).unwrap_or_else(|e| {
            warn!(error = %e, "failed to query volume size");
            0
        });
        DiskUsage { used, free, total }
    }

    // ---------------------------------------------------------------------
    // Heartbeat outbox
    // ---------------------------------------------------------------------

    pub fn push_heartbeat(&self, data: HeartbeatData) {
        self.outbox.lock().push(data);
    }

    pub fn drain_heartbeats(&self) -> Vec<HeartbeatData> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Put back reports that could not be delivered, ahead of newer ones.
    pub fn requeue_heartbeats(&self, mut data: Vec<HeartbeatData>) {
        let mut outbox = self.outbox.lock();
        data.append(&mut outbox);
        *outbox = data;
    }

    /// Signalled whenever a report should go out before the next tick.
    pub fn heartbeat_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.heartbeat_notify)
    }
}
