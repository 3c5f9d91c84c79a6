//! Encrypted, chunk-framed write-ahead log with split nonce storage.
//!
//! The log stores opaque, already-encrypted records in append-only segment
//! files of fixed 32 KiB blocks, framed as CRC-checked chunks, while the
//! 12-byte AEAD nonces needed to open them grow in lock-step in a separate
//! file destined for a trusted medium. A [`ChunkPosition`] is the stable
//! back-reference to a record: it survives process restarts and segment
//! rotations and carries the ordinal of the record's nonce.
//!
//! [`Wal`] is the single-writer log itself; [`ValueLog`] shards records
//! across several independent WALs by key hash so partitions can be
//! written concurrently.

#![forbid(unsafe_code)]

mod error;
mod nonce;
mod options;
mod position;
mod segment;
mod vlog;
mod wal;

pub use error::{WalError, WalResult};
pub use nonce::{Nonce, NONCE_SIZE};
pub use options::{Options, B, GB, KB, MB};
pub use position::{ChunkPosition, MAX_POSITION_LEN};
pub use segment::{ChunkType, BLOCK_SIZE, CHUNK_HEADER_SIZE};
pub use vlog::{
    default_hash_key, CipherError, KeyPosition, RecordCipher, ValueLog, ValueLogError,
    ValueLogOptions, ValueLogRecord, ValueLogResult,
};
pub use wal::{Reader, Wal};
