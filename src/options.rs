//! WAL configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const B: u64 = 1;
pub const KB: u64 = 1024 * B;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

/// Configuration options for a [`Wal`](crate::Wal).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Directory where the segment files are stored.
    pub dir_path: PathBuf,

    /// Directory where the nonce file is stored.
    ///
    /// Kept separate from `dir_path` so the nonce material can live on a
    /// trust-differentiated medium.
    pub nonce_dir_path: PathBuf,

    /// Maximum size of each segment file in bytes. Once the active segment
    /// would exceed this, the WAL rotates to a new one.
    pub segment_size: u64,

    /// File extension for segment and nonce files. Must start with `.`.
    pub segment_file_ext: String,

    /// Whether to fsync after every write.
    ///
    /// Setting this is required for durability of a single write operation,
    /// but also results in slower writes. If false and the machine crashes,
    /// some recent writes may be lost; if just the process crashes, no
    /// writes are lost.
    pub sync: bool,

    /// If non-zero and `sync` is false, fsync after this many bytes have
    /// been written since the last sync.
    pub bytes_per_sync: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir_path: std::env::temp_dir(),
            nonce_dir_path: std::env::temp_dir(),
            segment_size: GB,
            segment_file_ext: ".SEG".to_string(),
            sync: false,
            bytes_per_sync: 0,
        }
    }
}
