//! Compacted index: the key log a segment writes alongside its data.
//!
//! Each entry names a record by key and absolute offset (`offset + delta`).
//! Truncation markers record that entries at or after an offset were rolled
//! back.
//!
//! # File Format
//!
//! ```text
//! [magic:"SLCI"][version:u8][reserved:3B]
//! [type:u8][offset:i64][delta:i32][key_len:u32][key] *
//! [entry_count:u64][crc32:u32]
//! ```
//!
//! The trailing CRC32 covers every byte before it.

use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use seglog_types::Offset;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::StorageError;
use crate::batch::{RecordBatch, Records};

const MAGIC: &[u8; 4] = b"SLCI";
const VERSION: u8 = 0x01;
const PREAMBLE_SIZE: usize = 8;
const ENTRY_OVERHEAD: usize = 1 + 8 + 4 + 4;
const FOOTER_SIZE: usize = 8 + 4;

/// Kind of compacted index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// The latest write of a key.
    Key = 0,
    /// Everything at or after the entry's offset was rolled back.
    Truncation = 1,
}

impl EntryType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Key),
            1 => Some(Self::Truncation),
            _ => None,
        }
    }
}

/// One entry of a compacted index.
///
/// The record it names sits at `offset + delta`: `offset` is the base offset
/// of the batch and `delta` the record's offset delta within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompactedIndexEntry {
    pub entry_type: EntryType,
    /// Record key. Empty for truncation entries.
    pub key: Bytes,
    pub offset: Offset,
    pub delta: i32,
}

impl CompactedIndexEntry {
    /// Entry for the record with `key` at `offset + delta`.
    pub fn key(key: impl Into<Bytes>, offset: Offset, delta: i32) -> Self {
        Self {
            entry_type: EntryType::Key,
            key: key.into(),
            offset,
            delta,
        }
    }

    /// Marker rolling back every entry at or after `offset`.
    pub fn truncation(offset: Offset) -> Self {
        Self {
            entry_type: EntryType::Truncation,
            key: Bytes::new(),
            offset,
            delta: 0,
        }
    }

    /// Returns the offset of the record this entry names.
    pub fn absolute_offset(&self) -> Offset {
        self.offset.with_delta(self.delta)
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(ENTRY_OVERHEAD + self.key.len());
        buf.put_u8(self.entry_type as u8);
        buf.put_i64_le(self.offset.as_i64());
        buf.put_i32_le(self.delta);
        buf.put_u32_le(self.key.len() as u32);
        buf.put_slice(&self.key);
    }
}

/// Summary written at the end of a compacted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactedIndexFooter {
    /// Number of entries in the file.
    pub entries: u64,
    /// CRC32 of every byte before the footer.
    pub crc: u32,
}

// ============================================================================
// Writer
// ============================================================================

/// Appends entries to a new compacted index file.
#[derive(Debug)]
pub struct CompactedIndexWriter {
    path: PathBuf,
    file: BufWriter<File>,
    hasher: crc32fast::Hasher,
    entries: u64,
    scratch: BytesMut,
}

impl CompactedIndexWriter {
    /// Creates (or replaces) the index at `path`.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut writer = Self {
            file: BufWriter::new(File::create(&path).await?),
            path,
            hasher: crc32fast::Hasher::new(),
            entries: 0,
            scratch: BytesMut::new(),
        };

        let mut preamble = [0u8; PREAMBLE_SIZE];
        preamble[..4].copy_from_slice(MAGIC);
        preamble[4] = VERSION;
        writer.write_raw(&preamble).await?;
        Ok(writer)
    }

    /// Returns the path of the index being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of entries written so far.
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Appends a key entry for the record at `offset + delta`.
    pub async fn index(&mut self, key: &[u8], offset: Offset, delta: i32) -> Result<(), StorageError> {
        self.write_entry(&CompactedIndexEntry::key(Bytes::copy_from_slice(key), offset, delta))
            .await
    }

    /// Indexes every keyed record of an uncompressed batch.
    ///
    /// Compressed batches and records without a key add nothing.
    pub async fn index_batch(&mut self, batch: &RecordBatch) -> Result<(), StorageError> {
        let Records::Uncompressed(records) = batch.records() else {
            return Ok(());
        };
        for record in records {
            if let Some(key) = &record.key {
                self.write_entry(&CompactedIndexEntry::key(
                    key.clone(),
                    batch.base_offset(),
                    record.offset_delta,
                ))
                .await?;
            }
        }
        Ok(())
    }

    /// Records that entries at or after `offset` were rolled back.
    pub async fn truncate(&mut self, offset: Offset) -> Result<(), StorageError> {
        self.write_entry(&CompactedIndexEntry::truncation(offset)).await
    }

    /// Writes the footer and syncs the file.
    pub async fn close(mut self) -> Result<CompactedIndexFooter, StorageError> {
        let count = self.entries.to_le_bytes();
        self.hasher.update(&count);
        let crc = self.hasher.clone().finalize();

        self.file.write_all(&count).await?;
        self.file.write_all(&crc.to_le_bytes()).await?;
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;

        Ok(CompactedIndexFooter {
            entries: self.entries,
            crc,
        })
    }

    async fn write_entry(&mut self, entry: &CompactedIndexEntry) -> Result<(), StorageError> {
        let mut buf = std::mem::take(&mut self.scratch);
        buf.clear();
        entry.encode_into(&mut buf);
        let result = self.write_raw(&buf).await;
        self.scratch = buf;
        result?;
        self.entries += 1;
        Ok(())
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.hasher.update(bytes);
        self.file.write_all(bytes).await?;
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Sequential reader over a validated compacted index.
#[derive(Debug)]
pub struct CompactedIndexReader {
    path: PathBuf,
    body: Bytes,
    cursor: Bytes,
    footer: CompactedIndexFooter,
}

impl CompactedIndexReader {
    /// Loads the file and verifies its preamble and checksum.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let data = Bytes::from(tokio::fs::read(&path).await?);

        if data.len() < PREAMBLE_SIZE + FOOTER_SIZE {
            return Err(StorageError::IndexTruncated {
                expected: PREAMBLE_SIZE + FOOTER_SIZE,
                actual: data.len(),
            });
        }
        if &data[..4] != MAGIC {
            return Err(StorageError::InvalidIndexMagic);
        }
        if data[4] != VERSION {
            return Err(StorageError::UnsupportedIndexVersion(data[4]));
        }

        let crc_start = data.len() - 4;
        let stored = (&data[crc_start..]).get_u32_le();
        let computed = crc32fast::hash(&data[..crc_start]);
        if stored != computed {
            return Err(StorageError::IndexChecksumMismatch { stored, computed });
        }

        let entries = (&data[crc_start - 8..crc_start]).get_u64_le();
        let body = data.slice(PREAMBLE_SIZE..crc_start - 8);
        Ok(Self {
            path,
            cursor: body.clone(),
            body,
            footer: CompactedIndexFooter {
                entries,
                crc: stored,
            },
        })
    }

    /// Returns the path of the index being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry count recorded in the footer.
    pub fn len(&self) -> u64 {
        self.footer.entries
    }

    pub fn is_empty(&self) -> bool {
        self.footer.entries == 0
    }

    /// Returns the validated footer.
    pub fn footer(&self) -> CompactedIndexFooter {
        self.footer
    }

    /// Restarts iteration from the first entry.
    pub fn rewind(&mut self) {
        self.cursor = self.body.clone();
    }

    /// Decodes the next entry, or returns `None` after the last one.
    pub fn next_entry(&mut self) -> Result<Option<CompactedIndexEntry>, StorageError> {
        if !self.cursor.has_remaining() {
            return Ok(None);
        }
        if self.cursor.remaining() < ENTRY_OVERHEAD {
            return Err(StorageError::UnexpectedEof);
        }

        let type_byte = self.cursor.get_u8();
        let offset = Offset::new(self.cursor.get_i64_le());
        let delta = self.cursor.get_i32_le();
        let key_len = self.cursor.get_u32_le() as usize;
        let entry_type = EntryType::from_byte(type_byte).ok_or_else(|| StorageError::InvalidBatch {
            offset,
            reason: format!("unknown compacted index entry type {type_byte}"),
        })?;
        if self.cursor.remaining() < key_len {
            return Err(StorageError::UnexpectedEof);
        }

        Ok(Some(CompactedIndexEntry {
            entry_type,
            key: self.cursor.split_to(key_len),
            offset,
            delta,
        }))
    }
}
