//! Partitioned value log.
//!
//! Records are sharded across independent WALs by key hash so partitions
//! can be written concurrently. Each record is sealed with a freshly
//! generated random nonce through the caller-supplied cipher; the WAL keeps
//! ciphertext and nonce on their respective media.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel;
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;

use crate::error::WalError;
use crate::nonce::{Nonce, NONCE_SIZE};
use crate::options::Options;
use crate::position::ChunkPosition;
use crate::wal::Wal;

pub type ValueLogResult<T> = Result<T, ValueLogError>;

#[derive(Debug, Error)]
pub enum ValueLogError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("batch write canceled")]
    Canceled,
    #[error("value log record truncated")]
    RecordTruncated,
}

/// Failure inside the caller-supplied cipher.
#[derive(Debug, Error)]
#[error("cipher failure: {reason}")]
pub struct CipherError {
    pub reason: String,
}

/// The AEAD seam. The value log generates a fresh 12-byte nonce per record
/// and hands it to the cipher together with the plaintext; key management
/// and cipher construction stay outside this crate.
pub trait RecordCipher: Send + Sync {
    fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Partitions keys with the standard library hasher; deterministic across
/// runs and processes.
pub fn default_hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct ValueLogOptions {
    /// Directory for the partition WALs' segment files.
    pub dir_path: PathBuf,
    /// Directory for the partition WALs' nonce files.
    pub nonce_dir_path: PathBuf,
    /// Maximum segment size handed down to each partition WAL.
    pub segment_size: u64,
    /// Number of independent partitions.
    pub partition_num: u32,
    /// Maps a key to the partition index space.
    pub hash_key_fn: fn(&[u8]) -> u64,
    /// Seals and opens record plaintext.
    pub cipher: Arc<dyn RecordCipher>,
}

/// A key/value pair stored in the value log. Both sides are opaque bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueLogRecord {
    pub key: Bytes,
    pub value: Bytes,
}

/// Where a record landed: the partition plus the in-WAL position, tagged
/// with the record's key for the index layer above.
#[derive(Clone, Debug)]
pub struct KeyPosition {
    pub key: Bytes,
    pub partition: u32,
    pub position: ChunkPosition,
}

pub struct ValueLog {
    wals: Vec<Wal>,
    options: ValueLogOptions,
}

impl ValueLog {
    /// Opens one WAL per partition, each with its own file extension so
    /// the partitions share the two directories without colliding.
    pub fn open(options: ValueLogOptions) -> ValueLogResult<Self> {
        let mut wals = Vec::with_capacity(options.partition_num as usize);
        for partition in 0..options.partition_num {
            let wal = Wal::open(Options {
                dir_path: options.dir_path.clone(),
                nonce_dir_path: options.nonce_dir_path.clone(),
                segment_size: options.segment_size,
                segment_file_ext: format!(".VLOG.{partition}"),
                // The value log syncs manually.
                sync: false,
                bytes_per_sync: 0,
            })?;
            wals.push(wal);
        }
        Ok(Self { wals, options })
    }

    /// Writes a batch, fanning out one worker per non-empty partition.
    ///
    /// Each worker encrypts its records, buffers them into its partition's
    /// WAL and flushes them as one atomic batch. The first failure cancels
    /// the siblings and clears that partition's pending buffer. On success
    /// the per-partition position lists are concatenated; order within a
    /// partition follows the input, order across partitions is unspecified.
    pub fn write_batch(&self, records: Vec<ValueLogRecord>) -> ValueLogResult<Vec<KeyPosition>> {
        let partition_num = self.options.partition_num as usize;
        let mut partition_records: Vec<Vec<ValueLogRecord>> =
            (0..partition_num).map(|_| Vec::new()).collect();
        for record in records {
            let partition =
                (self.options.hash_key_fn)(&record.key) % u64::from(self.options.partition_num);
            partition_records[partition as usize].push(record);
        }

        let canceled = AtomicBool::new(false);
        let first_error: Mutex<Option<ValueLogError>> = Mutex::new(None);
        let (position_tx, position_rx) = channel::unbounded();

        std::thread::scope(|scope| {
            for (partition, records) in partition_records.into_iter().enumerate() {
                if records.is_empty() {
                    continue;
                }
                let wal = &self.wals[partition];
                let cipher = self.options.cipher.as_ref();
                let canceled = &canceled;
                let first_error = &first_error;
                let position_tx = position_tx.clone();
                scope.spawn(move || {
                    let outcome = write_partition(
                        wal,
                        cipher,
                        partition as u32,
                        records,
                        canceled,
                        &position_tx,
                    );
                    if let Err(err) = outcome {
                        wal.clear_pending_writes();
                        canceled.store(true, Ordering::SeqCst);
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                });
            }
        });
        drop(position_tx);

        if let Some(err) = first_error.lock().take() {
            return Err(err);
        }

        let mut key_positions = Vec::new();
        while let Ok(mut positions) = position_rx.try_recv() {
            key_positions.append(&mut positions);
        }
        Ok(key_positions)
    }

    /// Reads and opens the record at the given position.
    pub fn read(&self, position: &KeyPosition) -> ValueLogResult<ValueLogRecord> {
        let (ciphertext, nonce) =
            self.wals[position.partition as usize].read(&position.position)?;
        decode_record(&ciphertext, &nonce, self.options.cipher.as_ref())
    }

    /// Fsyncs every partition, first error wins.
    pub fn sync(&self) -> ValueLogResult<()> {
        for wal in &self.wals {
            wal.sync()?;
        }
        Ok(())
    }

    /// Closes every partition, first error wins.
    pub fn close(&mut self) -> ValueLogResult<()> {
        for wal in &mut self.wals {
            wal.close()?;
        }
        Ok(())
    }
}

fn write_partition(
    wal: &Wal,
    cipher: &dyn RecordCipher,
    partition: u32,
    records: Vec<ValueLogRecord>,
    canceled: &AtomicBool,
    position_tx: &channel::Sender<Vec<KeyPosition>>,
) -> ValueLogResult<()> {
    let mut keys = Vec::with_capacity(records.len());
    for record in records {
        if canceled.load(Ordering::SeqCst) {
            return Err(ValueLogError::Canceled);
        }
        let (ciphertext, nonce) = encode_record(&record, cipher);
        keys.push(record.key);
        wal.pending_writes(ciphertext, nonce.to_vec());
    }

    let positions = wal.write_all()?;
    let key_positions = keys
        .into_iter()
        .zip(positions)
        .map(|(key, position)| KeyPosition {
            key,
            partition,
            position,
        })
        .collect();
    let _ = position_tx.send(key_positions);
    Ok(())
}

// Plaintext layout: key length (4 LE) | key | value. The whole layout is
// sealed; only the nonce travels in the clear, on its own medium.
fn encode_record(record: &ValueLogRecord, cipher: &dyn RecordCipher) -> (Vec<u8>, Nonce) {
    let mut plaintext = Vec::with_capacity(4 + record.key.len() + record.value.len());
    plaintext.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
    plaintext.extend_from_slice(&record.key);
    plaintext.extend_from_slice(&record.value);

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    (cipher.encrypt(&nonce, &plaintext), nonce)
}

fn decode_record(
    ciphertext: &[u8],
    nonce: &Nonce,
    cipher: &dyn RecordCipher,
) -> ValueLogResult<ValueLogRecord> {
    let plaintext = cipher.decrypt(nonce, ciphertext)?;
    if plaintext.len() < 4 {
        return Err(ValueLogError::RecordTruncated);
    }
    let key_len = u32::from_le_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]])
        as usize;
    if 4 + key_len > plaintext.len() {
        return Err(ValueLogError::RecordTruncated);
    }
    Ok(ValueLogRecord {
        key: Bytes::copy_from_slice(&plaintext[4..4 + key_len]),
        value: Bytes::copy_from_slice(&plaintext[4 + key_len..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Reversible toy cipher; the real seam is exercised with an AEAD in the
    // integration tests.
    struct XorCipher;

    impl RecordCipher for XorCipher {
        fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
            plaintext
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ nonce[i % NONCE_SIZE])
                .collect()
        }

        fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
            Ok(self.encrypt(nonce, ciphertext))
        }
    }

    fn test_options(temp: &TempDir, partition_num: u32) -> ValueLogOptions {
        ValueLogOptions {
            dir_path: temp.path().join("vlog"),
            nonce_dir_path: temp.path().join("vlog-nonce"),
            segment_size: crate::options::GB,
            partition_num,
            hash_key_fn: default_hash_key,
            cipher: Arc::new(XorCipher),
        }
    }

    fn record(key: &str, value: &str) -> ValueLogRecord {
        ValueLogRecord {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    #[test]
    fn batch_roundtrips_across_partitions() {
        let temp = TempDir::new().unwrap();
        let vlog = ValueLog::open(test_options(&temp, 4)).unwrap();

        let records: Vec<ValueLogRecord> = (0..50)
            .map(|i| record(&format!("key-{i}"), &format!("value-{i}")))
            .collect();
        let positions = vlog.write_batch(records.clone()).unwrap();
        assert_eq!(positions.len(), records.len());

        for position in &positions {
            let read = vlog.read(position).unwrap();
            assert_eq!(read.key, position.key);
            let expected = records.iter().find(|r| r.key == position.key).unwrap();
            assert_eq!(read.value, expected.value);
        }
    }

    #[test]
    fn partition_assignment_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let vlog = ValueLog::open(test_options(&temp, 8)).unwrap();

        let first = vlog.write_batch(vec![record("stable-key", "v1")]).unwrap();
        let second = vlog.write_batch(vec![record("stable-key", "v2")]).unwrap();
        assert_eq!(first[0].partition, second[0].partition);
        assert_eq!(
            first[0].partition,
            (default_hash_key(b"stable-key") % 8) as u32
        );
    }

    #[test]
    fn order_within_a_partition_follows_input() {
        let temp = TempDir::new().unwrap();
        // One partition forces all records into a single WAL.
        let vlog = ValueLog::open(test_options(&temp, 1)).unwrap();

        let records: Vec<ValueLogRecord> =
            (0..10).map(|i| record(&format!("k{i}"), "v")).collect();
        let positions = vlog.write_batch(records.clone()).unwrap();

        for (record, position) in records.iter().zip(&positions) {
            assert_eq!(record.key, position.key);
        }
        let value_nums: Vec<u64> = positions.iter().map(|p| p.position.value_num).collect();
        assert_eq!(value_nums, (0..10u64).collect::<Vec<_>>());
    }

    #[test]
    fn failed_batch_reports_first_error() {
        let temp = TempDir::new().unwrap();
        let options = ValueLogOptions {
            segment_size: 256,
            ..test_options(&temp, 2)
        };
        let vlog = ValueLog::open(options).unwrap();

        let records: Vec<ValueLogRecord> = (0..8)
            .map(|i| {
                ValueLogRecord {
                    key: Bytes::copy_from_slice(format!("key-{i}").as_bytes()),
                    value: Bytes::from(vec![0u8; 128]),
                }
            })
            .collect();
        let err = vlog.write_batch(records).unwrap_err();
        assert!(matches!(
            err,
            ValueLogError::Wal(WalError::PendingSizeTooLarge { .. }) | ValueLogError::Canceled
        ));

        // Pending buffers were cleared; a small batch still goes through.
        let positions = vlog.write_batch(vec![record("after", "ok")]).unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[test]
    fn empty_batch_yields_no_positions() {
        let temp = TempDir::new().unwrap();
        let vlog = ValueLog::open(test_options(&temp, 3)).unwrap();
        assert!(vlog.write_batch(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn sync_and_close_fan_out() {
        let temp = TempDir::new().unwrap();
        let mut vlog = ValueLog::open(test_options(&temp, 2)).unwrap();
        vlog.write_batch(vec![record("a", "1"), record("b", "2")])
            .unwrap();
        vlog.sync().unwrap();
        vlog.close().unwrap();
    }
}
