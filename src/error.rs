//! WAL error taxonomy.

use std::path::PathBuf;

use thiserror::Error;

pub type WalResult<T> = Result<T, WalError>;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("the segment file is closed")]
    Closed,
    #[error("invalid crc, the data may be corrupted")]
    InvalidCrc,
    #[error("end of segment")]
    Eof,
    #[error("data size {size} can't be larger than segment size {segment_size}")]
    ValueTooLarge { size: u64, segment_size: u64 },
    #[error("pending writes size {size} can't be larger than segment size {segment_size}")]
    PendingSizeTooLarge { size: u64, segment_size: u64 },
    #[error("segment file {segment_id} not found")]
    SegmentNotFound { segment_id: u32 },
    #[error("short nonce read at ordinal {value_num}")]
    ShortNonceRead { value_num: u64 },
    #[error("nonce file size {size} is not a multiple of the nonce width")]
    NonceFileCorrupt { size: u64 },
    #[error("segment file extension must start with '.' (got {ext:?})")]
    InvalidExtension { ext: String },
    #[error("chunk position truncated")]
    PositionTruncated,
}

impl WalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WalError::Io {
            path: Some(path.into()),
            source,
        }
    }
}
