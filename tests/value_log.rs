//! Value log integration tests with a real AEAD bound to the cipher seam.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce as GcmNonce};
use bytes::Bytes;
use tempfile::TempDir;

use sealog::{
    default_hash_key, CipherError, Nonce, RecordCipher, ValueLog, ValueLogError, ValueLogOptions,
    ValueLogRecord, WalError, CHUNK_HEADER_SIZE, GB,
};

struct AesGcmCipher {
    inner: Aes256Gcm,
}

impl AesGcmCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            inner: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }
}

impl RecordCipher for AesGcmCipher {
    fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
        self.inner
            .encrypt(GcmNonce::from_slice(nonce), plaintext)
            .expect("aes-gcm encrypt")
    }

    fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.inner
            .decrypt(GcmNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError {
                reason: "aead open failed".to_string(),
            })
    }
}

const TEST_KEY: [u8; 32] = [0x42; 32];

fn test_options(temp: &TempDir, partition_num: u32) -> ValueLogOptions {
    ValueLogOptions {
        dir_path: temp.path().join("vlog"),
        nonce_dir_path: temp.path().join("vlog-nonce"),
        segment_size: GB,
        partition_num,
        hash_key_fn: default_hash_key,
        cipher: Arc::new(AesGcmCipher::new(&TEST_KEY)),
    }
}

fn record(key: String, value: Vec<u8>) -> ValueLogRecord {
    ValueLogRecord {
        key: Bytes::from(key.into_bytes()),
        value: Bytes::from(value),
    }
}

#[test]
fn sealed_batch_roundtrips_through_all_partitions() {
    let temp = TempDir::new().unwrap();
    let vlog = ValueLog::open(test_options(&temp, 4)).unwrap();

    let records: Vec<ValueLogRecord> = (0..200)
        .map(|i| record(format!("user:{i:04}"), vec![(i % 256) as u8; 64 + i % 100]))
        .collect();
    let expected: HashMap<Bytes, Bytes> = records
        .iter()
        .map(|r| (r.key.clone(), r.value.clone()))
        .collect();

    let positions = vlog.write_batch(records).unwrap();
    assert_eq!(positions.len(), 200);
    vlog.sync().unwrap();

    for position in &positions {
        assert!(position.partition < 4);
        let read = vlog.read(position).unwrap();
        assert_eq!(read.key, position.key);
        assert_eq!(&read.value, expected.get(&read.key).unwrap());
    }
}

#[test]
fn on_disk_bytes_are_not_plaintext() {
    let temp = TempDir::new().unwrap();
    let options = test_options(&temp, 1);
    let dir_path = options.dir_path.clone();
    let vlog = ValueLog::open(options).unwrap();

    let secret = b"very secret payload".to_vec();
    vlog.write_batch(vec![record("k".to_string(), secret.clone())])
        .unwrap();
    vlog.sync().unwrap();

    let raw = fs::read(dir_path.join(format!("{:09}.VLOG.0", 1))).unwrap();
    let found = raw
        .windows(secret.len())
        .any(|window| window == secret.as_slice());
    assert!(!found);
}

#[test]
fn positions_survive_reopen_with_the_same_key() {
    let temp = TempDir::new().unwrap();

    let positions = {
        let vlog = ValueLog::open(test_options(&temp, 2)).unwrap();
        let positions = vlog
            .write_batch(vec![
                record("alpha".to_string(), b"1".to_vec()),
                record("beta".to_string(), b"2".to_vec()),
                record("gamma".to_string(), b"3".to_vec()),
            ])
            .unwrap();
        vlog.sync().unwrap();
        positions
    };

    let vlog = ValueLog::open(test_options(&temp, 2)).unwrap();
    for position in &positions {
        let read = vlog.read(position).unwrap();
        assert_eq!(read.key, position.key);
    }
}

#[test]
fn tampered_segment_bytes_fail_integrity() {
    let temp = TempDir::new().unwrap();
    let options = test_options(&temp, 1);
    let dir_path = options.dir_path.clone();
    let vlog = ValueLog::open(options).unwrap();

    let positions = vlog
        .write_batch(vec![record("victim".to_string(), vec![7u8; 100])])
        .unwrap();
    vlog.sync().unwrap();

    let path = dir_path.join(format!("{:09}.VLOG.0", 1));
    let mut raw = fs::read(&path).unwrap();
    let payload_start =
        positions[0].position.chunk_offset as usize + CHUNK_HEADER_SIZE as usize;
    raw[payload_start] ^= 0x01;
    fs::write(&path, raw).unwrap();

    let vlog = ValueLog::open(test_options(&temp, 1)).unwrap();
    let err = vlog.read(&positions[0]).unwrap_err();
    assert!(matches!(err, ValueLogError::Wal(WalError::InvalidCrc)));
}

#[test]
fn large_batches_interleave_cleanly() {
    let temp = TempDir::new().unwrap();
    let vlog = ValueLog::open(test_options(&temp, 3)).unwrap();

    let mut all_positions = Vec::new();
    for round in 0..5 {
        let records: Vec<ValueLogRecord> = (0..40)
            .map(|i| record(format!("r{round}-k{i}"), vec![round as u8; 32]))
            .collect();
        all_positions.extend(vlog.write_batch(records).unwrap());
    }
    vlog.sync().unwrap();

    for position in &all_positions {
        let read = vlog.read(position).unwrap();
        assert_eq!(read.key, position.key);
    }
}
