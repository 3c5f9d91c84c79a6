//! Append-only nonce file.
//!
//! One 12-byte nonce per logical record, concatenated with no framing: the
//! nonce for record `n` lives at byte offset `n * 12`. The file is meant to
//! be placed on a trust-differentiated medium, away from the ciphertext.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{WalError, WalResult};
use crate::position::ChunkPosition;
use crate::segment::read_exact_at;

/// Width of an AEAD nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// A 12-byte AEAD nonce.
pub type Nonce = [u8; NONCE_SIZE];

pub(crate) fn nonce_file_name(dir_path: &Path, ext: &str) -> PathBuf {
    dir_path.join(format!("nonce{ext}"))
}

#[derive(Debug)]
pub(crate) struct NonceFile {
    file: File,
    path: PathBuf,
    cur_num: u64,
    closed: bool,
}

impl NonceFile {
    /// Opens (creating if absent) the nonce file in `dir_path`.
    ///
    /// A file whose size is not a multiple of the nonce width is rejected:
    /// it can only be the product of a torn write or external tampering.
    pub(crate) fn open(dir_path: &Path, ext: &str) -> WalResult<Self> {
        let path = nonce_file_name(dir_path, ext);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|source| WalError::io(&path, source))?;
        let size = file
            .metadata()
            .map_err(|source| WalError::io(&path, source))?
            .len();
        if size % NONCE_SIZE as u64 != 0 {
            return Err(WalError::NonceFileCorrupt { size });
        }
        Ok(Self {
            file,
            path,
            cur_num: size / NONCE_SIZE as u64,
            closed: false,
        })
    }

    /// Appends one nonce and stamps its ordinal into `position`.
    ///
    /// An empty nonce is a no-op so callers that do not use split storage
    /// can pass none.
    pub(crate) fn write(&mut self, nonce: &[u8], position: &mut ChunkPosition) -> WalResult<()> {
        if self.closed {
            return Err(WalError::Closed);
        }
        if nonce.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(nonce)
            .map_err(|source| WalError::io(&self.path, source))?;
        position.value_num = self.cur_num;
        self.cur_num += 1;
        Ok(())
    }

    /// Appends a batch of nonces in order, stamping each position.
    pub(crate) fn write_all(
        &mut self,
        nonces: &[Vec<u8>],
        positions: &mut [ChunkPosition],
    ) -> WalResult<()> {
        if self.closed {
            return Err(WalError::Closed);
        }
        for (nonce, position) in nonces.iter().zip(positions.iter_mut()) {
            self.file
                .write_all(nonce)
                .map_err(|source| WalError::io(&self.path, source))?;
            position.value_num = self.cur_num;
            self.cur_num += 1;
        }
        Ok(())
    }

    /// Reads the nonce at the given ordinal.
    pub(crate) fn read_at(&self, value_num: u64) -> WalResult<Nonce> {
        if self.closed {
            return Err(WalError::Closed);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        read_exact_at(
            &self.file,
            &self.path,
            &mut nonce,
            value_num * NONCE_SIZE as u64,
        )
        .map_err(|err| match err {
            WalError::Io { source, .. }
                if source.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                WalError::ShortNonceRead { value_num }
            }
            other => other,
        })?;
        Ok(nonce)
    }

    pub(crate) fn sync(&self) -> WalResult<()> {
        if self.closed {
            return Ok(());
        }
        self.file
            .sync_all()
            .map_err(|source| WalError::io(&self.path, source))
    }

    pub(crate) fn close(&mut self) -> WalResult<()> {
        self.closed = true;
        Ok(())
    }

    pub(crate) fn remove(&mut self) -> WalResult<()> {
        self.closed = true;
        fs::remove_file(&self.path).map_err(|source| WalError::io(&self.path, source))
    }

    pub(crate) fn rename(&mut self, dir_path: &Path, ext: &str) -> WalResult<()> {
        let new_path = nonce_file_name(dir_path, ext);
        fs::rename(&self.path, &new_path).map_err(|source| WalError::io(&new_path, source))?;
        self.path = new_path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ordinals_increment_from_zero() {
        let temp = TempDir::new().unwrap();
        let mut nonce_file = NonceFile::open(temp.path(), ".SEG").unwrap();

        let mut first = ChunkPosition::default();
        let mut second = ChunkPosition::default();
        nonce_file.write(&[1u8; NONCE_SIZE], &mut first).unwrap();
        nonce_file.write(&[2u8; NONCE_SIZE], &mut second).unwrap();

        assert_eq!(first.value_num, 0);
        assert_eq!(second.value_num, 1);
        assert_eq!(nonce_file.read_at(0).unwrap(), [1u8; NONCE_SIZE]);
        assert_eq!(nonce_file.read_at(1).unwrap(), [2u8; NONCE_SIZE]);
    }

    #[test]
    fn reopen_resumes_ordinal_from_file_size() {
        let temp = TempDir::new().unwrap();
        {
            let mut nonce_file = NonceFile::open(temp.path(), ".SEG").unwrap();
            let mut position = ChunkPosition::default();
            nonce_file.write(&[7u8; NONCE_SIZE], &mut position).unwrap();
            nonce_file.write(&[8u8; NONCE_SIZE], &mut position).unwrap();
        }

        let mut nonce_file = NonceFile::open(temp.path(), ".SEG").unwrap();
        let mut position = ChunkPosition::default();
        nonce_file.write(&[9u8; NONCE_SIZE], &mut position).unwrap();
        assert_eq!(position.value_num, 2);
        assert_eq!(nonce_file.read_at(2).unwrap(), [9u8; NONCE_SIZE]);
    }

    #[test]
    fn open_rejects_size_not_multiple_of_nonce_width() {
        let temp = TempDir::new().unwrap();
        fs::write(nonce_file_name(temp.path(), ".SEG"), [0u8; 5]).unwrap();

        let err = NonceFile::open(temp.path(), ".SEG").unwrap_err();
        assert!(matches!(err, WalError::NonceFileCorrupt { size: 5 }));
    }

    #[test]
    fn read_past_end_is_short_read() {
        let temp = TempDir::new().unwrap();
        let nonce_file = NonceFile::open(temp.path(), ".SEG").unwrap();

        let err = nonce_file.read_at(0).unwrap_err();
        assert!(matches!(err, WalError::ShortNonceRead { value_num: 0 }));
    }

    #[test]
    fn empty_nonce_is_skipped() {
        let temp = TempDir::new().unwrap();
        let mut nonce_file = NonceFile::open(temp.path(), ".SEG").unwrap();

        let mut position = ChunkPosition::default();
        nonce_file.write(&[], &mut position).unwrap();
        assert_eq!(position.value_num, 0);

        let mut stamped = ChunkPosition::default();
        nonce_file.write(&[3u8; NONCE_SIZE], &mut stamped).unwrap();
        assert_eq!(stamped.value_num, 0);
    }
}
