use dfs_types::{Result, Status, StatusCode};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Read an entire file to a string.
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        Status::with_message(StatusCode::IO_ERROR, format!("read {}: {}", path.display(), e))
    })
}

/// Write data to a file.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).map_err(|e| {
        Status::with_message(StatusCode::IO_ERROR, format!("write {}: {}", path.display(), e))
    })
}

/// Atomic write: write to temp file, fsync, then rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp_path = dir.join(format!(".tmp.{}", std::process::id()));
    write_file(&tmp_path, data)?;
    if let Ok(f) = std::fs::File::open(&tmp_path) {
        let _ = f.sync_all();
    }
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        Status::with_message(StatusCode::IO_ERROR, format!("rename: {}", e))
    })
}

/// Read at most `max_bytes` from the end of a file.
pub fn read_tail(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let io_err = |e: std::io::Error| {
        Status::with_message(StatusCode::IO_ERROR, format!("read {}: {}", path.display(), e))
    };
    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).map_err(io_err)?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.take(max_bytes).read_to_end(&mut buf).map_err(io_err)?;
    Ok(buf)
}
