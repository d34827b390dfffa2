//! Bounded file reading for application shells.
//!
//! Small files are cheaper to read inline than to bounce through the
//! blocking pool; large files would stall the worker's event loop. The
//! threshold picks the path.

use std::{io, path::Path};

/// Reads a file, inline when its size is at or under `threshold` bytes,
/// through the blocking pool otherwise.
pub async fn read_file_bounded(path: impl AsRef<Path>, threshold: u64) -> io::Result<Vec<u8>> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    if size <= threshold {
        return std::fs::read(path);
    }

    let path = path.to_owned();
    tokio::task::spawn_blocking(move || std::fs::read(path))
        .await
        .map_err(|join_error| io::Error::new(io::ErrorKind::Other, join_error))?
}
