//! Sparse offset index for a segment.
//!
//! The [`SegmentIndex`] maps a subset of batch base offsets to the byte
//! position where the batch starts. Entries are added every `step_bytes`
//! of appended data, and the first batch is always tracked, so a lookup
//! lands at or before the wanted batch and the reader scans forward.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Offset  │  Size  │  Description                     │
//! ├──────────────────────────────────────────────────────┤
//! │  0       │  4     │  Magic bytes: "SLGI"             │
//! │  4       │  1     │  Version: 0x01                   │
//! │  5       │  3     │  Reserved (zero padding)         │
//! │  8       │  8     │  Base offset (i64 LE)            │
//! │  16      │  8     │  Max offset (i64 LE)             │
//! │  24      │  8     │  Max timestamp (i64 LE)          │
//! │  32      │  8     │  Entry count (u64 LE)            │
//! │  40      │  12*N  │  [relative:u32][filepos:u64]     │
//! │  40+12*N │  4     │  CRC32 of bytes 0..(40+12*N)     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Offsets are stored relative to the base offset, which bounds a segment
//! to `u32::MAX` offsets of indexable range.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use seglog_types::{Offset, Timestamp};
use tokio::io::AsyncWriteExt;

use crate::StorageError;
use crate::batch::RecordBatchHeader;

// ============================================================================
// File Format Constants
// ============================================================================

/// Magic bytes identifying a segment index file.
const MAGIC: &[u8; 4] = b"SLGI";

/// Current index file format version.
const VERSION: u8 = 0x01;

/// Reserved bytes for future use.
const RESERVED: [u8; 3] = [0u8; 3];

/// Header size: magic(4) + version(1) + reserved(3) + base(8) + max
/// offset(8) + max timestamp(8) + count(8) = 40 bytes
const HEADER_SIZE: usize = 40;
const ENTRY_SIZE: usize = 12;
const CRC_SIZE: usize = 4;

/// A tracked batch start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Base offset of the tracked batch.
    pub offset: Offset,
    /// Byte position in the data file where the batch starts.
    pub filepos: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RelativeEntry {
    relative: u32,
    filepos: u64,
}

/// Sparse offset-to-position index, persisted next to its segment.
///
/// # Invariants
///
/// - Entries are sorted by offset and by file position
/// - The first appended batch is always tracked
/// - `max_offset` is the last offset of any tracked batch, or
///   [`Offset::NONE`] while empty
#[derive(Debug)]
pub struct SegmentIndex {
    path: PathBuf,
    base_offset: Offset,
    max_offset: Offset,
    max_timestamp: Timestamp,
    step_bytes: u64,
    accumulated: u64,
    entries: Vec<RelativeEntry>,
    needs_persist: bool,
}

impl SegmentIndex {
    /// Creates an empty index for the segment starting at `base_offset`.
    ///
    /// Nothing is read from or written to `path` until
    /// [`materialize_index`](Self::materialize_index) or
    /// [`flush`](Self::flush) is called.
    ///
    /// # Panics
    ///
    /// Debug builds panic if `step_bytes` is zero.
    pub fn new(path: impl Into<PathBuf>, base_offset: Offset, step_bytes: u64) -> Self {
        debug_assert!(step_bytes > 0, "index step must be positive");
        Self {
            path: path.into(),
            base_offset,
            max_offset: Offset::NONE,
            max_timestamp: Timestamp::MISSING,
            step_bytes,
            accumulated: 0,
            entries: Vec::new(),
            needs_persist: false,
        }
    }

    /// Returns the path of the index file.
    pub fn filename(&self) -> &Path {
        &self.path
    }

    /// Returns the base offset of the owning segment.
    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    /// Returns the last offset of any tracked batch, or [`Offset::NONE`].
    pub fn max_offset(&self) -> Offset {
        self.max_offset
    }

    /// Returns the greatest batch timestamp seen so far.
    pub fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    /// Returns the number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no batch has been tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a batch appended at `filepos`, adding an entry when the
    /// accumulated bytes since the last entry reach the step.
    pub fn maybe_track(&mut self, header: &RecordBatchHeader, filepos: u64) {
        self.accumulated += u64::try_from(header.size_bytes).unwrap_or(0);
        self.max_offset = self.max_offset.max(header.last_offset());
        self.max_timestamp = self.max_timestamp.max(header.max_timestamp);
        self.needs_persist = true;

        if !self.entries.is_empty() && self.accumulated < self.step_bytes {
            return;
        }
        let Ok(relative) = u32::try_from((header.base_offset - self.base_offset).as_i64()) else {
            tracing::debug!(
                offset = %header.base_offset,
                base_offset = %self.base_offset,
                "batch outside indexable range"
            );
            return;
        };

        debug_assert!(
            self.entries
                .last()
                .is_none_or(|last| last.relative < relative && last.filepos < filepos),
            "index entries must increase"
        );
        self.entries.push(RelativeEntry { relative, filepos });
        self.accumulated = 0;
    }

    /// Returns the tracked entry with the greatest offset `<= offset`.
    ///
    /// Returns `None` if `offset` precedes the first tracked batch. The
    /// batch containing `offset` starts at or after the returned position.
    pub fn find_nearest(&self, offset: Offset) -> Option<IndexEntry> {
        let relative = (offset - self.base_offset).as_i64();
        if relative < 0 {
            return None;
        }
        let relative = u32::try_from(relative).unwrap_or(u32::MAX);
        let idx = self.entries.partition_point(|e| e.relative <= relative);
        let entry = self.entries.get(idx.checked_sub(1)?)?;
        Some(self.absolute(*entry))
    }

    /// Drops entries after `offset` and persists the result.
    ///
    /// An `offset` before the base offset empties the index.
    pub async fn truncate(&mut self, offset: Offset) -> Result<(), StorageError> {
        let relative = (offset - self.base_offset).as_i64();
        if relative < 0 {
            self.entries.clear();
            self.max_offset = Offset::NONE;
        } else {
            let relative = u32::try_from(relative).unwrap_or(u32::MAX);
            let keep = self.entries.partition_point(|e| e.relative <= relative);
            self.entries.truncate(keep);
            self.max_offset = self.max_offset.min(offset);
        }
        self.accumulated = 0;
        self.needs_persist = true;
        self.flush().await
    }

    /// Loads a previously persisted index.
    ///
    /// Returns `false`, leaving the index untouched, when the file is
    /// missing, empty, corrupt or belongs to a different base offset.
    pub async fn materialize_index(&mut self) -> Result<bool, StorageError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(false);
        }

        let loaded = match decode(&data) {
            Ok(loaded) => loaded,
            Err(error) => {
                tracing::warn!(path = %self.path.display(), %error, "discarding unreadable index");
                return Ok(false);
            }
        };
        if loaded.base_offset != self.base_offset || loaded.entries.is_empty() {
            return Ok(false);
        }

        self.max_offset = loaded.max_offset;
        self.max_timestamp = loaded.max_timestamp;
        self.entries = loaded.entries;
        self.accumulated = 0;
        self.needs_persist = false;
        Ok(true)
    }

    /// Persists the index if it changed since the last flush.
    ///
    /// The file is written to a `.tmp` sibling, synced, then renamed over
    /// the old index, so readers see either the old or the new contents.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        if !self.needs_persist {
            return Ok(());
        }
        let buf = self.encode();

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        self.needs_persist = false;
        Ok(())
    }

    /// Flushes pending changes. The index stays usable afterwards.
    pub async fn close(&mut self) -> Result<(), StorageError> {
        self.flush().await
    }

    fn absolute(&self, entry: RelativeEntry) -> IndexEntry {
        IndexEntry {
            offset: self.base_offset + Offset::new(i64::from(entry.relative)),
            filepos: entry.filepos,
        }
    }

    fn encode(&self) -> BytesMut {
        let total_size = HEADER_SIZE + self.entries.len() * ENTRY_SIZE + CRC_SIZE;
        let mut buf = BytesMut::with_capacity(total_size);

        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_slice(&RESERVED);
        buf.put_i64_le(self.base_offset.as_i64());
        buf.put_i64_le(self.max_offset.as_i64());
        buf.put_i64_le(self.max_timestamp.as_millis());
        buf.put_u64_le(self.entries.len() as u64);
        for entry in &self.entries {
            buf.put_u32_le(entry.relative);
            buf.put_u64_le(entry.filepos);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        debug_assert_eq!(buf.len(), total_size, "buffer size mismatch");
        buf
    }
}

struct LoadedIndex {
    base_offset: Offset,
    max_offset: Offset,
    max_timestamp: Timestamp,
    entries: Vec<RelativeEntry>,
}

fn decode(data: &[u8]) -> Result<LoadedIndex, StorageError> {
    if data.len() < HEADER_SIZE + CRC_SIZE {
        return Err(StorageError::IndexTruncated {
            expected: HEADER_SIZE + CRC_SIZE,
            actual: data.len(),
        });
    }
    if &data[..4] != MAGIC {
        return Err(StorageError::InvalidIndexMagic);
    }
    if data[4] != VERSION {
        return Err(StorageError::UnsupportedIndexVersion(data[4]));
    }

    let mut header = &data[8..HEADER_SIZE];
    let base_offset = Offset::new(header.get_i64_le());
    let max_offset = Offset::new(header.get_i64_le());
    let max_timestamp = Timestamp::new(header.get_i64_le());
    let count = usize::try_from(header.get_u64_le()).unwrap_or(usize::MAX);

    let expected = count
        .checked_mul(ENTRY_SIZE)
        .and_then(|n| n.checked_add(HEADER_SIZE + CRC_SIZE))
        .unwrap_or(usize::MAX);
    if data.len() != expected {
        return Err(StorageError::IndexTruncated {
            expected,
            actual: data.len(),
        });
    }

    let crc_start = expected - CRC_SIZE;
    let stored = (&data[crc_start..]).get_u32_le();
    let computed = crc32fast::hash(&data[..crc_start]);
    if stored != computed {
        return Err(StorageError::IndexChecksumMismatch { stored, computed });
    }

    let mut body = &data[HEADER_SIZE..crc_start];
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(RelativeEntry {
            relative: body.get_u32_le(),
            filepos: body.get_u64_le(),
        });
    }

    Ok(LoadedIndex {
        base_offset,
        max_offset,
        max_timestamp,
        entries,
    })
}

impl Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{file:{}, base_offset:{}, max_offset:{}, entries:{}, step:{}}}",
            self.path.display(),
            self.base_offset,
            self.max_offset,
            self.entries.len(),
            self.step_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RecordBatchBuilder;

    fn header(base: i64, records: usize) -> RecordBatchHeader {
        let mut builder = RecordBatchBuilder::new(Offset::new(base));
        for _ in 0..records {
            builder = builder.add_record("key", "value");
        }
        builder.build().unwrap().header().clone()
    }

    /// Tracks `count` two-record batches starting at `base`, laid out back to back.
    fn populate(index: &mut SegmentIndex, base: i64, count: i64) -> Vec<(Offset, u64)> {
        let mut filepos = 0;
        let mut starts = Vec::new();
        for i in 0..count {
            let h = header(base + i * 2, 2);
            index.maybe_track(&h, filepos);
            starts.push((h.base_offset, filepos));
            filepos += h.size_bytes as u64;
        }
        starts
    }

    #[test]
    fn first_batch_is_always_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::new(dir.path().join("0.index"), Offset::ZERO, 1 << 20);

        populate(&mut index, 0, 5);

        assert_eq!(index.len(), 1);
        assert_eq!(index.max_offset(), Offset::new(9));
        let nearest = index.find_nearest(Offset::new(7)).unwrap();
        assert_eq!(nearest, IndexEntry { offset: Offset::ZERO, filepos: 0 });
    }

    #[test]
    fn step_of_one_byte_tracks_every_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::new(dir.path().join("0.index"), Offset::ZERO, 1);

        let starts = populate(&mut index, 0, 4);
        assert_eq!(index.len(), 4);

        let (offset, filepos) = starts[2];
        assert_eq!(index.find_nearest(Offset::new(5)), Some(IndexEntry { offset, filepos }));
        assert_eq!(index.find_nearest(Offset::new(4)), Some(IndexEntry { offset, filepos }));
    }

    #[test]
    fn lookup_before_base_finds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::new(dir.path().join("10.index"), Offset::new(10), 1);
        populate(&mut index, 10, 2);

        assert_eq!(index.find_nearest(Offset::new(9)), None);
    }

    #[tokio::test]
    async fn truncate_drops_later_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SegmentIndex::new(dir.path().join("0.index"), Offset::ZERO, 1);
        populate(&mut index, 0, 4);

        index.truncate(Offset::new(3)).await.unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.max_offset(), Offset::new(3));
        assert_eq!(index.find_nearest(Offset::new(7)).unwrap().offset, Offset::new(2));
    }

    #[tokio::test]
    async fn flushed_index_materializes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.index");
        let mut index = SegmentIndex::new(&path, Offset::ZERO, 1);
        let starts = populate(&mut index, 0, 3);
        index.flush().await.unwrap();

        let mut reloaded = SegmentIndex::new(&path, Offset::ZERO, 1);
        assert!(reloaded.materialize_index().await.unwrap());
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.max_offset(), Offset::new(5));
        assert_eq!(
            reloaded.find_nearest(Offset::new(5)).unwrap().filepos,
            starts[2].1
        );
    }

    #[tokio::test]
    async fn missing_or_empty_file_does_not_materialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.index");

        let mut index = SegmentIndex::new(&path, Offset::ZERO, 1);
        assert!(!index.materialize_index().await.unwrap());

        tokio::fs::write(&path, b"").await.unwrap();
        assert!(!index.materialize_index().await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_does_not_materialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.index");
        let mut index = SegmentIndex::new(&path, Offset::ZERO, 1);
        populate(&mut index, 0, 2);
        index.flush().await.unwrap();

        let mut raw = tokio::fs::read(&path).await.unwrap();
        raw[HEADER_SIZE] ^= 0xff;
        tokio::fs::write(&path, &raw).await.unwrap();

        let mut reloaded = SegmentIndex::new(&path, Offset::ZERO, 1);
        assert!(!reloaded.materialize_index().await.unwrap());
        assert!(reloaded.is_empty());
    }

    #[test]
    fn decode_rejects_foreign_magic() {
        let mut raw = vec![0u8; HEADER_SIZE + CRC_SIZE];
        raw[..4].copy_from_slice(b"NOPE");
        assert!(matches!(decode(&raw), Err(StorageError::InvalidIndexMagic)));
    }
}
