//! Append-only segment files.
//!
//! A segment is a run of fixed 32 KiB blocks filled with CRC-framed chunks.
//! A chunk never crosses a block boundary; records larger than one block's
//! payload capacity are split into a `First`/`Middle.../Last` chain.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crc32fast::Hasher;
use parking_lot::Mutex;

use crate::error::{WalError, WalResult};
use crate::position::ChunkPosition;

/// Chunk header layout: crc32 (4) | payload length (2) | type (1).
pub const CHUNK_HEADER_SIZE: u32 = 7;

/// Block alignment unit within a segment file.
pub const BLOCK_SIZE: u32 = 32 * 1024;

/// How a chunk relates to the record it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// The whole record in one chunk.
    Full = 0,
    /// First chunk of a spanning record.
    First = 1,
    /// Interior chunk of a spanning record.
    Middle = 2,
    /// Final chunk of a spanning record.
    Last = 3,
}

pub(crate) fn segment_file_name(dir_path: &Path, ext: &str, id: u32) -> PathBuf {
    dir_path.join(format!("{id:09}{ext}"))
}

// Process-wide free list of block buffers for the non-startup read path.
static BLOCK_POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

fn get_block() -> Vec<u8> {
    BLOCK_POOL
        .lock()
        .pop()
        .unwrap_or_else(|| vec![0u8; BLOCK_SIZE as usize])
}

fn put_block(block: Vec<u8>) {
    BLOCK_POOL.lock().push(block);
}

// Startup traversal is single-reader, so one segment-owned block survives
// across reads instead of drawing from the pool. `block_number == -1` marks
// the cache invalid.
#[derive(Debug)]
struct StartupBlock {
    block: Vec<u8>,
    block_number: i64,
}

#[derive(Debug)]
pub(crate) struct Segment {
    id: u32,
    file: File,
    path: PathBuf,
    current_block_number: u32,
    current_block_size: u32,
    closed: bool,
    startup_block: Mutex<StartupBlock>,
    is_startup_traversal: bool,
}

impl Segment {
    /// Opens (creating if absent) the segment file with the given id.
    /// The in-memory block cursor is derived from the on-disk size.
    pub(crate) fn open(dir_path: &Path, ext: &str, id: u32) -> WalResult<Self> {
        let path = segment_file_name(dir_path, ext, id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|source| WalError::io(&path, source))?;
        let offset = file
            .metadata()
            .map_err(|source| WalError::io(&path, source))?
            .len();
        Ok(Self {
            id,
            file,
            path,
            current_block_number: (offset / u64::from(BLOCK_SIZE)) as u32,
            current_block_size: (offset % u64::from(BLOCK_SIZE)) as u32,
            closed: false,
            startup_block: Mutex::new(StartupBlock {
                block: vec![0u8; BLOCK_SIZE as usize],
                block_number: -1,
            }),
            is_startup_traversal: false,
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn size(&self) -> u64 {
        u64::from(self.current_block_number) * u64::from(BLOCK_SIZE)
            + u64::from(self.current_block_size)
    }

    pub(crate) fn set_startup_traversal(&mut self, enabled: bool) {
        self.is_startup_traversal = enabled;
    }

    /// Appends `data` as one logical record, possibly split across chunks.
    pub(crate) fn write(&mut self, data: &[u8]) -> WalResult<ChunkPosition> {
        if self.closed {
            return Err(WalError::Closed);
        }

        let origin_block_number = self.current_block_number;
        let origin_block_size = self.current_block_size;

        let mut chunk_buffer =
            Vec::with_capacity(data.len() + 2 * CHUNK_HEADER_SIZE as usize);
        let position = match self.write_to_buffer(data, &mut chunk_buffer) {
            Ok(position) => position,
            Err(err) => {
                self.current_block_number = origin_block_number;
                self.current_block_size = origin_block_size;
                return Err(err);
            }
        };
        if let Err(err) = self.write_chunk_buffer(&chunk_buffer) {
            self.current_block_number = origin_block_number;
            self.current_block_size = origin_block_size;
            return Err(err);
        }
        Ok(position)
    }

    /// Appends each element of `batch` in order. On failure the in-memory
    /// block cursor is restored; partial on-disk bytes are left behind and
    /// ignored by readers, which halt at the CRC mismatch or EOF.
    pub(crate) fn write_all(&mut self, batch: &[Vec<u8>]) -> WalResult<Vec<ChunkPosition>> {
        if self.closed {
            return Err(WalError::Closed);
        }

        let origin_block_number = self.current_block_number;
        let origin_block_size = self.current_block_size;

        let mut chunk_buffer = Vec::new();
        let mut positions = Vec::with_capacity(batch.len());
        for data in batch {
            match self.write_to_buffer(data, &mut chunk_buffer) {
                Ok(position) => positions.push(position),
                Err(err) => {
                    self.current_block_number = origin_block_number;
                    self.current_block_size = origin_block_size;
                    return Err(err);
                }
            }
        }
        if let Err(err) = self.write_chunk_buffer(&chunk_buffer) {
            self.current_block_number = origin_block_number;
            self.current_block_size = origin_block_size;
            return Err(err);
        }
        Ok(positions)
    }

    // Frames `data` into `chunk_buffer` and advances the block cursor.
    // Padding is emitted when the remaining block bytes cannot hold a
    // chunk header; padding counts toward the file offset but not toward
    // the returned position's `chunk_size`.
    fn write_to_buffer(
        &mut self,
        data: &[u8],
        chunk_buffer: &mut Vec<u8>,
    ) -> WalResult<ChunkPosition> {
        if self.closed {
            return Err(WalError::Closed);
        }

        if self.current_block_size + CHUNK_HEADER_SIZE >= BLOCK_SIZE
            && self.current_block_size < BLOCK_SIZE
        {
            let padding = (BLOCK_SIZE - self.current_block_size) as usize;
            chunk_buffer.resize(chunk_buffer.len() + padding, 0);
            self.current_block_number += 1;
            self.current_block_size = 0;
        }

        let mut position = ChunkPosition {
            segment_id: self.id,
            block_number: self.current_block_number,
            chunk_offset: u64::from(self.current_block_size),
            ..ChunkPosition::default()
        };

        let data_size = data.len() as u32;
        if self.current_block_size + data_size + CHUNK_HEADER_SIZE <= BLOCK_SIZE {
            append_chunk(chunk_buffer, data, ChunkType::Full);
            position.chunk_size = data_size + CHUNK_HEADER_SIZE;
        } else {
            let mut left_size = data_size;
            let mut block_count = 0u32;
            let mut curr_block_size = self.current_block_size;

            while left_size > 0 {
                let mut chunk_size = BLOCK_SIZE - curr_block_size - CHUNK_HEADER_SIZE;
                if chunk_size > left_size {
                    chunk_size = left_size;
                }
                let end = (data_size - left_size + chunk_size).min(data_size);

                let chunk_type = if left_size == data_size {
                    ChunkType::First
                } else if left_size == chunk_size {
                    ChunkType::Last
                } else {
                    ChunkType::Middle
                };
                append_chunk(
                    chunk_buffer,
                    &data[(data_size - left_size) as usize..end as usize],
                    chunk_type,
                );

                left_size -= chunk_size;
                block_count += 1;
                curr_block_size = (curr_block_size + chunk_size + CHUNK_HEADER_SIZE) % BLOCK_SIZE;
            }
            position.chunk_size = block_count * CHUNK_HEADER_SIZE + data_size;
        }

        self.current_block_size += position.chunk_size;
        if self.current_block_size >= BLOCK_SIZE {
            self.current_block_number += self.current_block_size / BLOCK_SIZE;
            self.current_block_size %= BLOCK_SIZE;
        }

        Ok(position)
    }

    fn write_chunk_buffer(&mut self, buf: &[u8]) -> WalResult<()> {
        debug_assert!(self.current_block_size <= BLOCK_SIZE);
        self.file
            .write_all(buf)
            .map_err(|source| WalError::io(&self.path, source))?;
        // The cached startup block may no longer match the file contents.
        self.startup_block.lock().block_number = -1;
        Ok(())
    }

    /// Reassembles the chunk chain starting at the given location and
    /// returns the concatenated payload.
    pub(crate) fn read(&self, block_number: u32, chunk_offset: u64) -> WalResult<Bytes> {
        let (data, _) = self.read_internal(block_number, chunk_offset)?;
        Ok(data)
    }

    /// Like [`Segment::read`] but also returns the position of the chunk
    /// that follows the chain, for forward iteration.
    fn read_internal(
        &self,
        block_number: u32,
        chunk_offset: u64,
    ) -> WalResult<(Bytes, ChunkPosition)> {
        if self.closed {
            return Err(WalError::Closed);
        }

        if self.is_startup_traversal {
            let mut cached = self.startup_block.lock();
            let startup = &mut *cached;
            self.read_chunks(
                block_number,
                chunk_offset,
                &mut startup.block,
                Some(&mut startup.block_number),
            )
        } else {
            let mut block = get_block();
            let outcome = self.read_chunks(block_number, chunk_offset, &mut block, None);
            put_block(block);
            outcome
        }
    }

    fn read_chunks(
        &self,
        mut block_number: u32,
        mut chunk_offset: u64,
        block: &mut [u8],
        mut cached_block_number: Option<&mut i64>,
    ) -> WalResult<(Bytes, ChunkPosition)> {
        let segment_size = self.size();
        let mut result: Vec<u8> = Vec::new();
        let mut next_chunk = ChunkPosition {
            segment_id: self.id,
            ..ChunkPosition::default()
        };

        loop {
            let offset = u64::from(block_number) * u64::from(BLOCK_SIZE);
            let size = segment_size
                .saturating_sub(offset)
                .min(u64::from(BLOCK_SIZE));

            if chunk_offset + u64::from(CHUNK_HEADER_SIZE) > size {
                return Err(WalError::Eof);
            }

            match cached_block_number.as_deref_mut() {
                // Re-read the cached block only when it is a different one,
                // or when it was partial last time and may have grown.
                Some(cached) => {
                    if *cached != i64::from(block_number) || size != u64::from(BLOCK_SIZE) {
                        read_exact_at(&self.file, &self.path, &mut block[..size as usize], offset)?;
                        *cached = i64::from(block_number);
                    }
                }
                None => {
                    read_exact_at(&self.file, &self.path, &mut block[..size as usize], offset)?;
                }
            }

            let header_start = chunk_offset as usize;
            let header_end = header_start + CHUNK_HEADER_SIZE as usize;
            let header = &block[header_start..header_end];

            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let checksum_end = header_end + length;
            if checksum_end as u64 > size {
                return Err(WalError::InvalidCrc);
            }

            let mut hasher = Hasher::new();
            hasher.update(&block[header_start + 4..checksum_end]);
            let saved_checksum = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            if saved_checksum != hasher.finalize() {
                return Err(WalError::InvalidCrc);
            }

            result.extend_from_slice(&block[header_end..checksum_end]);

            let chunk_type = header[6];
            if chunk_type == ChunkType::Full as u8 || chunk_type == ChunkType::Last as u8 {
                next_chunk.block_number = block_number;
                next_chunk.chunk_offset = checksum_end as u64;
                // If the rest of the block cannot hold another header, the
                // next chunk starts at the next block.
                if checksum_end as u64 + u64::from(CHUNK_HEADER_SIZE) >= u64::from(BLOCK_SIZE) {
                    next_chunk.block_number += 1;
                    next_chunk.chunk_offset = 0;
                }
                break;
            }
            block_number += 1;
            chunk_offset = 0;
        }

        Ok((Bytes::from(result), next_chunk))
    }

    /// Returns a forward iterator over the segment's records.
    pub(crate) fn new_reader(&self) -> SegmentReader<'_> {
        self.reader_at(0, 0)
    }

    /// Returns a reader resuming from a saved cursor.
    pub(crate) fn reader_at(&self, block_number: u32, chunk_offset: u64) -> SegmentReader<'_> {
        SegmentReader {
            segment: self,
            block_number,
            chunk_offset,
        }
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
        let new_path = segment_file_name(dir_path, ext, self.id);
        fs::rename(&self.path, &new_path).map_err(|source| WalError::io(&new_path, source))?;
        self.path = new_path;
        Ok(())
    }
}

fn append_chunk(buf: &mut Vec<u8>, data: &[u8], chunk_type: ChunkType) {
    let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
    header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
    header[6] = chunk_type as u8;

    let mut hasher = Hasher::new();
    hasher.update(&header[4..]);
    hasher.update(data);
    header[..4].copy_from_slice(&hasher.finalize().to_le_bytes());

    buf.extend_from_slice(&header);
    buf.extend_from_slice(data);
}

#[cfg(unix)]
pub(crate) fn read_exact_at(
    file: &File,
    path: &Path,
    buf: &mut [u8],
    offset: u64,
) -> WalResult<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
        .map_err(|source| WalError::io(path, source))
}

#[cfg(windows)]
pub(crate) fn read_exact_at(
    file: &File,
    path: &Path,
    mut buf: &mut [u8],
    mut offset: u64,
) -> WalResult<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file
            .seek_read(buf, offset)
            .map_err(|source| WalError::io(path, source))?;
        if n == 0 {
            return Err(WalError::io(
                path,
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Forward iterator over a single segment, yielding each record's payload
/// and position until end of segment.
pub(crate) struct SegmentReader<'a> {
    segment: &'a Segment,
    block_number: u32,
    chunk_offset: u64,
}

impl SegmentReader<'_> {
    /// The cursor past the last record yielded, for re-attaching a reader
    /// to this segment later.
    pub(crate) fn cursor(&self) -> (u32, u64) {
        (self.block_number, self.chunk_offset)
    }

    pub(crate) fn next(&mut self) -> WalResult<(Bytes, ChunkPosition)> {
        if self.segment.closed {
            return Err(WalError::Closed);
        }

        let (data, next_chunk) = self
            .segment
            .read_internal(self.block_number, self.chunk_offset)?;

        // The byte distance to the next chunk. An estimate only: it counts
        // any padding skipped at block tails.
        let start = u64::from(self.block_number) * u64::from(BLOCK_SIZE) + self.chunk_offset;
        let end = u64::from(next_chunk.block_number) * u64::from(BLOCK_SIZE)
            + next_chunk.chunk_offset;
        let position = ChunkPosition {
            segment_id: self.segment.id,
            block_number: self.block_number,
            chunk_offset: self.chunk_offset,
            chunk_size: (end - start) as u32,
            ..ChunkPosition::default()
        };

        self.block_number = next_chunk.block_number;
        self.chunk_offset = next_chunk.chunk_offset;

        Ok((data, position))
    }
}
