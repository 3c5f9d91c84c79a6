//! Write-ahead log over rotating segment files and a co-indexed nonce file.

use std::collections::BTreeMap;
use std::fs;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::{WalError, WalResult};
use crate::nonce::{Nonce, NonceFile};
use crate::options::Options;
use crate::position::ChunkPosition;
use crate::segment::{segment_file_name, Segment, BLOCK_SIZE, CHUNK_HEADER_SIZE};

const INITIAL_SEGMENT_FILE_ID: u32 = 1;

/// A write-ahead log holding one active segment open for appends, a map of
/// older read-only segments, and the nonce file that grows in lock-step
/// with the record count.
///
/// Writes take an exclusive lock over the log state; reads share one. The
/// pending-write buffer has its own lock so buffering does not contend with
/// an in-flight batch flush.
#[derive(Debug)]
pub struct Wal {
    inner: RwLock<WalInner>,
    pending: Mutex<PendingWrites>,
    options: Options,
}

#[derive(Debug)]
struct WalInner {
    active: Segment,
    older: BTreeMap<u32, Segment>,
    nonce_file: NonceFile,
    bytes_write: u32,
    rename_ids: Vec<u32>,
}

#[derive(Default, Debug)]
struct PendingWrites {
    data: Vec<Vec<u8>>,
    nonces: Vec<Vec<u8>>,
    size: u64,
}

// Upper bound on the framed size of a record: worst-case padding before the
// first chunk plus one header per block touched.
fn max_data_write_size(size: u64) -> u64 {
    u64::from(CHUNK_HEADER_SIZE)
        + size
        + (size / u64::from(BLOCK_SIZE) + 1) * u64::from(CHUNK_HEADER_SIZE)
}

impl Wal {
    /// Opens a WAL with the given options, creating the directories if
    /// missing and scanning `dir_path` for existing segment files. The
    /// highest segment id becomes the active segment; an empty directory
    /// starts at id 1.
    pub fn open(options: Options) -> WalResult<Self> {
        if !options.segment_file_ext.starts_with('.') {
            return Err(WalError::InvalidExtension {
                ext: options.segment_file_ext,
            });
        }

        fs::create_dir_all(&options.dir_path)
            .map_err(|source| WalError::io(&options.dir_path, source))?;
        fs::create_dir_all(&options.nonce_dir_path)
            .map_err(|source| WalError::io(&options.nonce_dir_path, source))?;

        let mut segment_ids = Vec::new();
        let entries = fs::read_dir(&options.dir_path)
            .map_err(|source| WalError::io(&options.dir_path, source))?;
        for entry in entries {
            let entry = entry.map_err(|source| WalError::io(&options.dir_path, source))?;
            let name = entry.file_name();
            match parse_segment_id(&name.to_string_lossy(), &options.segment_file_ext) {
                Some(id) => segment_ids.push(id),
                None => {
                    tracing::debug!(file = %name.to_string_lossy(), "skipping non-segment file");
                }
            }
        }

        let nonce_file = NonceFile::open(&options.nonce_dir_path, &options.segment_file_ext)?;

        segment_ids.sort_unstable();
        let mut older = BTreeMap::new();
        let active = match segment_ids.split_last() {
            None => Segment::open(
                &options.dir_path,
                &options.segment_file_ext,
                INITIAL_SEGMENT_FILE_ID,
            )?,
            Some((&last, rest)) => {
                for &id in rest {
                    let segment =
                        Segment::open(&options.dir_path, &options.segment_file_ext, id)?;
                    older.insert(id, segment);
                }
                Segment::open(&options.dir_path, &options.segment_file_ext, last)?
            }
        };
        tracing::debug!(
            active_segment_id = active.id(),
            older_segments = older.len(),
            "opened wal"
        );

        Ok(Self {
            inner: RwLock::new(WalInner {
                active,
                older,
                nonce_file,
                bytes_write: 0,
                rename_ids: Vec::new(),
            }),
            pending: Mutex::new(PendingWrites::default()),
            options,
        })
    }

    /// Writes one record and its nonce, returning the record's position.
    ///
    /// Rotates first when the active segment could not hold the worst-case
    /// framing of `data`. Depending on the sync policy, the segment and
    /// nonce file are fsynced afterwards.
    pub fn write(&self, data: &[u8], nonce: &[u8]) -> WalResult<ChunkPosition> {
        let mut inner = self.inner.write();

        if data.len() as u64 + u64::from(CHUNK_HEADER_SIZE) > self.options.segment_size {
            return Err(WalError::ValueTooLarge {
                size: data.len() as u64,
                segment_size: self.options.segment_size,
            });
        }
        if inner.active.size() + max_data_write_size(data.len() as u64)
            > self.options.segment_size
        {
            inner.rotate_active_segment(&self.options)?;
        }

        let mut position = inner.active.write(data)?;
        inner.nonce_file.write(nonce, &mut position)?;

        inner.bytes_write += position.chunk_size;
        let need_sync = self.options.sync
            || (self.options.bytes_per_sync > 0
                && inner.bytes_write >= self.options.bytes_per_sync);
        if need_sync {
            inner.active.sync()?;
            inner.nonce_file.sync()?;
            inner.bytes_write = 0;
        }

        Ok(position)
    }

    /// Buffers a record for a later [`Wal::write_all`] batch flush.
    pub fn pending_writes(&self, data: Vec<u8>, nonce: Vec<u8>) {
        let mut pending = self.pending.lock();
        pending.size += max_data_write_size(data.len() as u64);
        pending.data.push(data);
        pending.nonces.push(nonce);
    }

    /// Discards the pending-write buffer.
    pub fn clear_pending_writes(&self) {
        let mut pending = self.pending.lock();
        pending.size = 0;
        pending.data.clear();
        pending.nonces.clear();
    }

    /// Flushes the pending buffer as one batch and returns the positions in
    /// buffer order. The buffer is cleared whether or not the flush
    /// succeeds. Does not sync; call [`Wal::sync`] for durability.
    pub fn write_all(&self) -> WalResult<Vec<ChunkPosition>> {
        let mut pending = self.pending.lock();
        if pending.data.is_empty() {
            return Ok(Vec::new());
        }
        let data = std::mem::take(&mut pending.data);
        let nonces = std::mem::take(&mut pending.nonces);
        let pending_size = std::mem::take(&mut pending.size);
        drop(pending);

        let mut inner = self.inner.write();
        if pending_size > self.options.segment_size {
            return Err(WalError::PendingSizeTooLarge {
                size: pending_size,
                segment_size: self.options.segment_size,
            });
        }
        if inner.active.size() + pending_size > self.options.segment_size {
            inner.rotate_active_segment(&self.options)?;
        }

        let mut positions = inner.active.write_all(&data)?;
        inner.nonce_file.write_all(&nonces, &mut positions)?;
        Ok(positions)
    }

    /// Reads the record and nonce at the given position.
    pub fn read(&self, position: &ChunkPosition) -> WalResult<(Bytes, Nonce)> {
        let inner = self.inner.read();
        let segment = inner.segment_by_id(position.segment_id)?;
        let nonce = inner.nonce_file.read_at(position.value_num)?;
        let data = segment.read(position.block_number, position.chunk_offset)?;
        Ok((data, nonce))
    }

    /// Returns a reader over every record in the WAL, in segment-id then
    /// file order.
    pub fn new_reader(&self) -> Reader<'_> {
        self.new_reader_with_max(0)
    }

    /// Returns a reader restricted to segments with id at most `segment_id`
    /// (0 means no restriction).
    pub fn new_reader_with_max(&self, segment_id: u32) -> Reader<'_> {
        let inner = self.inner.read();
        let mut segment_ids: Vec<u32> = inner
            .older
            .keys()
            .copied()
            .chain(std::iter::once(inner.active.id()))
            .filter(|&id| segment_id == 0 || id <= segment_id)
            .collect();
        segment_ids.sort_unstable();
        Reader {
            wal: self,
            segment_ids,
            current: 0,
            block_number: 0,
            chunk_offset: 0,
            value_num: 0,
            pushed: None,
        }
    }

    /// Returns a reader positioned at the first record whose
    /// `(segment_id, block_number, chunk_offset)` is at least `start`'s.
    ///
    /// Records before the start are scanned (not skipped wholesale) so the
    /// reader's nonce ordinal stays aligned with the records it yields.
    pub fn new_reader_with_start(&self, start: &ChunkPosition) -> WalResult<Reader<'_>> {
        let mut reader = self.new_reader();
        let target = (start.segment_id, start.block_number, start.chunk_offset);
        while let Some((data, nonce, position)) = reader.next()? {
            if (position.segment_id, position.block_number, position.chunk_offset) >= target {
                reader.pushed = Some((data, nonce, position));
                break;
            }
        }
        Ok(reader)
    }

    /// Forces a rotation even if the active segment is not full.
    pub fn open_new_active_segment(&self) -> WalResult<()> {
        let mut inner = self.inner.write();
        inner.active.sync()?;
        inner.nonce_file.sync()?;
        let segment = Segment::open(
            &self.options.dir_path,
            &self.options.segment_file_ext,
            inner.active.id() + 1,
        )?;
        let old = std::mem::replace(&mut inner.active, segment);
        inner.older.insert(old.id(), old);
        Ok(())
    }

    /// Id of the segment currently open for appends.
    pub fn active_segment_id(&self) -> u32 {
        self.inner.read().active.id()
    }

    /// True when the WAL holds no records: a single empty active segment.
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.older.is_empty() && inner.active.size() == 0
    }

    /// Switches every segment to (or from) the single-reader startup
    /// traversal mode, which reuses one block buffer per segment.
    pub fn set_is_startup_traversal(&self, enabled: bool) {
        let mut inner = self.inner.write();
        for segment in inner.older.values_mut() {
            segment.set_startup_traversal(enabled);
        }
        inner.active.set_startup_traversal(enabled);
    }

    /// Fsyncs the active segment and the nonce file.
    pub fn sync(&self) -> WalResult<()> {
        let inner = self.inner.write();
        inner.active.sync()?;
        inner.nonce_file.sync()
    }

    /// Flushes and closes every file. Closed segment ids are remembered so
    /// [`Wal::rename_file_ext`] can rename them afterwards.
    pub fn close(&mut self) -> WalResult<()> {
        let inner = self.inner.get_mut();
        let ids: Vec<u32> = inner.older.keys().copied().collect();
        for id in ids {
            if let Some(segment) = inner.older.get_mut(&id) {
                segment.close()?;
            }
            if !inner.rename_ids.contains(&id) {
                inner.rename_ids.push(id);
            }
        }
        let active_id = inner.active.id();
        if !inner.rename_ids.contains(&active_id) {
            inner.rename_ids.push(active_id);
        }
        inner.active.close()?;
        inner.nonce_file.close()
    }

    /// Removes every segment file and the nonce file.
    pub fn delete(&mut self) -> WalResult<()> {
        let inner = self.inner.get_mut();
        for segment in inner.older.values_mut() {
            segment.remove()?;
        }
        inner.older.clear();
        inner.active.remove()?;
        inner.nonce_file.remove()
    }

    /// Renames every closed segment file and the nonce file to a new
    /// extension. Renames are per-file; a crash mid-way leaves a mix.
    pub fn rename_file_ext(&mut self, ext: &str) -> WalResult<()> {
        if !ext.starts_with('.') {
            return Err(WalError::InvalidExtension {
                ext: ext.to_string(),
            });
        }
        let dir_path = self.options.dir_path.clone();
        let nonce_dir_path = self.options.nonce_dir_path.clone();
        let old_ext = self.options.segment_file_ext.clone();
        let inner = self.inner.get_mut();

        for &id in &inner.rename_ids {
            let old_path = segment_file_name(&dir_path, &old_ext, id);
            let new_path = segment_file_name(&dir_path, ext, id);
            fs::rename(&old_path, &new_path)
                .map_err(|source| WalError::io(&new_path, source))?;
        }
        inner.nonce_file.rename(&nonce_dir_path, ext)?;

        self.options.segment_file_ext = ext.to_string();
        Ok(())
    }
}

impl WalInner {
    fn segment_by_id(&self, segment_id: u32) -> WalResult<&Segment> {
        if segment_id == self.active.id() {
            Ok(&self.active)
        } else {
            self.older
                .get(&segment_id)
                .ok_or(WalError::SegmentNotFound { segment_id })
        }
    }

    fn rotate_active_segment(&mut self, options: &Options) -> WalResult<()> {
        self.active.sync()?;
        self.nonce_file.sync()?;
        self.bytes_write = 0;
        let segment = Segment::open(
            &options.dir_path,
            &options.segment_file_ext,
            self.active.id() + 1,
        )?;
        tracing::debug!(segment_id = segment.id(), "rotated active segment");
        let old = std::mem::replace(&mut self.active, segment);
        self.older.insert(old.id(), old);
        Ok(())
    }
}

fn parse_segment_id(file_name: &str, ext: &str) -> Option<u32> {
    file_name
        .strip_suffix(ext)
        .and_then(|stem| stem.parse::<u32>().ok())
}

/// Forward iterator over every record in a WAL, ascending by segment id
/// then file order.
///
/// The reader carries its own nonce ordinal, incremented once per record,
/// so nonces are fetched positionally and back-stamped into each yielded
/// position.
pub struct Reader<'a> {
    wal: &'a Wal,
    segment_ids: Vec<u32>,
    current: usize,
    block_number: u32,
    chunk_offset: u64,
    value_num: u64,
    pushed: Option<(Bytes, Nonce, ChunkPosition)>,
}

impl Reader<'_> {
    /// Returns the next `(data, nonce, position)` tuple, or `None` at the
    /// end of the log.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> WalResult<Option<(Bytes, Nonce, ChunkPosition)>> {
        if let Some(item) = self.pushed.take() {
            return Ok(Some(item));
        }

        let inner = self.wal.inner.read();
        loop {
            let Some(&segment_id) = self.segment_ids.get(self.current) else {
                return Ok(None);
            };
            let segment = inner.segment_by_id(segment_id)?;

            // The lock cannot be held between calls, so the segment reader
            // is re-attached from the saved cursor under it each time.
            let mut segment_reader = segment.reader_at(self.block_number, self.chunk_offset);
            match segment_reader.next() {
                Ok((data, mut position)) => {
                    (self.block_number, self.chunk_offset) = segment_reader.cursor();
                    position.value_num = self.value_num;

                    let Ok(nonce) = inner.nonce_file.read_at(self.value_num) else {
                        return Ok(None);
                    };
                    self.value_num += 1;
                    return Ok(Some((data, nonce, position)));
                }
                Err(WalError::Eof) => {
                    self.current += 1;
                    self.block_number = 0;
                    self.chunk_offset = 0;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
