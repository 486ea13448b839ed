//! Streaming reducers over compacted index entries and record batches.
//!
//! A reducer consumes items one at a time and produces a summary when the
//! stream ends. Compaction chains several passes over the same compacted
//! index, each pass narrowing the set of entries that survive:
//!
//! ```text
//! TruncationOffsetReducer  ──▶ live natural indices
//! CompactionKeyReducer     ──▶ latest entry per key (bounded memory)
//! IndexFilteredCopyReducer ──▶ filtered compacted index
//! CompactedOffsetListReducer ─▶ surviving absolute offsets
//! ```
//!
//! A *natural index* is an entry's zero-based position in its stream.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roaring::{RoaringBitmap, RoaringTreemap};
use seglog_config::CompactionConfig;
use seglog_types::Offset;
use tokio::io::AsyncRead;

use crate::StorageError;
use crate::batch::{BatchReader, RecordBatch};
use crate::compaction::index::{
    CompactedIndexEntry, CompactedIndexReader, CompactedIndexWriter, EntryType,
};

/// Whether a reducer wants more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIteration {
    /// Keep feeding items.
    No,
    /// Stop the stream; no further `step` calls follow.
    Yes,
}

/// A stateful consumer of a stream of `T`.
#[allow(async_fn_in_trait)]
pub trait Reducer<T> {
    type Summary;

    /// Consumes one item.
    async fn step(&mut self, item: T) -> Result<StopIteration, StorageError>;

    /// Produces the summary once the stream is exhausted or stopped.
    fn end_of_stream(self) -> Self::Summary;
}

/// Feeds every compacted index entry to `reducer` until it asks to stop.
pub async fn consume_index<R>(
    reader: &mut CompactedIndexReader,
    mut reducer: R,
) -> Result<R::Summary, StorageError>
where
    R: Reducer<CompactedIndexEntry>,
{
    while let Some(entry) = reader.next_entry()? {
        if reducer.step(entry).await? == StopIteration::Yes {
            break;
        }
    }
    Ok(reducer.end_of_stream())
}

/// Feeds every batch of a data stream to `reducer` until it asks to stop.
pub async fn consume_batches<S, R>(
    reader: &mut BatchReader<S>,
    mut reducer: R,
) -> Result<R::Summary, StorageError>
where
    S: AsyncRead + Unpin,
    R: Reducer<RecordBatch>,
{
    while let Some(batch) = reader.next_batch().await? {
        if reducer.step(batch).await? == StopIteration::Yes {
            break;
        }
    }
    Ok(reducer.end_of_stream())
}

// ============================================================================
// Truncation pass
// ============================================================================

/// Computes which entries survive truncation markers.
///
/// A truncation at offset `o` discards every key entry seen so far whose
/// absolute offset is `>= o`. The summary is the set of natural indices of
/// the remaining key entries.
#[derive(Debug, Default)]
pub struct TruncationOffsetReducer {
    live: BTreeMap<Offset, u32>,
    natural_index: u32,
}

impl TruncationOffsetReducer {
    /// Reducer that has seen no entries.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reducer<CompactedIndexEntry> for TruncationOffsetReducer {
    type Summary = RoaringBitmap;

    async fn step(&mut self, entry: CompactedIndexEntry) -> Result<StopIteration, StorageError> {
        let offset = entry.absolute_offset();
        match entry.entry_type {
            EntryType::Truncation => {
                let _rolled_back = self.live.split_off(&offset);
            }
            EntryType::Key => {
                self.live.insert(offset, self.natural_index);
            }
        }
        self.natural_index += 1;
        Ok(StopIteration::No)
    }

    fn end_of_stream(self) -> RoaringBitmap {
        self.live.into_values().collect()
    }
}

// ============================================================================
// Key deduplication pass
// ============================================================================

#[derive(Debug)]
struct KeySlot {
    key: Bytes,
    offset: Offset,
    natural_index: u32,
}

/// Keeps the newest entry per key under a memory budget.
///
/// Memory is the sum of the lengths of the keys held. When admitting a new
/// key would exceed `max_mem`, uniformly random keys are evicted first.
/// Evicted entries are retained in the summary: dropping them would lose
/// data once their key has been forgotten.
#[derive(Debug)]
pub struct CompactionKeyReducer {
    slots: Vec<KeySlot>,
    positions: HashMap<Bytes, usize>,
    evicted: RoaringBitmap,
    to_keep: Option<RoaringBitmap>,
    mem_usage: usize,
    max_mem: usize,
    natural_index: u32,
    rng: StdRng,
}

impl CompactionKeyReducer {
    /// Reducer holding at most `max_mem` key bytes, seeded from the OS.
    ///
    /// When `to_keep` is set, entries whose natural index is not in it are
    /// skipped and never reach the summary.
    pub fn new(max_mem: usize, to_keep: Option<RoaringBitmap>) -> Self {
        Self::with_rng(max_mem, to_keep, StdRng::from_entropy())
    }

    /// Reducer whose eviction choices are reproducible.
    pub fn with_seed(max_mem: usize, to_keep: Option<RoaringBitmap>, seed: u64) -> Self {
        Self::with_rng(max_mem, to_keep, StdRng::seed_from_u64(seed))
    }

    /// Reducer sized and seeded from `config`.
    pub fn from_config(config: &CompactionConfig, to_keep: Option<RoaringBitmap>) -> Self {
        match config.eviction_seed {
            Some(seed) => Self::with_seed(config.key_map_max_memory_bytes, to_keep, seed),
            None => Self::new(config.key_map_max_memory_bytes, to_keep),
        }
    }

    fn with_rng(max_mem: usize, to_keep: Option<RoaringBitmap>, rng: StdRng) -> Self {
        Self {
            slots: Vec::new(),
            positions: HashMap::new(),
            evicted: RoaringBitmap::new(),
            to_keep,
            mem_usage: 0,
            max_mem,
            natural_index: 0,
            rng,
        }
    }

    /// Returns the key bytes currently held.
    pub fn mem_usage(&self) -> usize {
        self.mem_usage
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no key is held.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn admit(&mut self, key: Bytes, offset: Offset) {
        while self.mem_usage + key.len() > self.max_mem && !self.slots.is_empty() {
            let victim = self.rng.gen_range(0..self.slots.len());
            self.evict(victim);
        }

        self.mem_usage += key.len();
        self.positions.insert(key.clone(), self.slots.len());
        self.slots.push(KeySlot {
            key,
            offset,
            natural_index: self.natural_index,
        });
    }

    fn evict(&mut self, victim: usize) {
        let removed = self.slots.swap_remove(victim);
        self.positions.remove(&removed.key);
        if let Some(moved) = self.slots.get(victim) {
            self.positions.insert(moved.key.clone(), victim);
        }
        self.mem_usage -= removed.key.len();
        self.evicted.insert(removed.natural_index);
    }
}

impl Reducer<CompactedIndexEntry> for CompactionKeyReducer {
    type Summary = RoaringBitmap;

    async fn step(&mut self, entry: CompactedIndexEntry) -> Result<StopIteration, StorageError> {
        let excluded = self
            .to_keep
            .as_ref()
            .is_some_and(|keep| !keep.contains(self.natural_index));

        if !excluded {
            let offset = entry.absolute_offset();
            match self.positions.get(&entry.key) {
                Some(&slot) => {
                    let held = &mut self.slots[slot];
                    if offset > held.offset {
                        held.offset = offset;
                        held.natural_index = self.natural_index;
                    }
                }
                None => self.admit(entry.key, offset),
            }
        }

        self.natural_index += 1;
        Ok(StopIteration::No)
    }

    fn end_of_stream(self) -> RoaringBitmap {
        let mut survivors = self.evicted;
        survivors.extend(self.slots.iter().map(|slot| slot.natural_index));
        survivors
    }
}

// ============================================================================
// Filtered copy pass
// ============================================================================

/// Copies entries whose natural index is in a bitmap to a new index.
///
/// Copied entries are written as key entries. The summary is the number of
/// entries written.
#[derive(Debug)]
pub struct IndexFilteredCopyReducer<'w> {
    survivors: RoaringBitmap,
    natural_index: u32,
    writer: &'w mut CompactedIndexWriter,
    written: u64,
}

impl<'w> IndexFilteredCopyReducer<'w> {
    /// Reducer writing the `survivors` of its input to `writer`.
    pub fn new(survivors: RoaringBitmap, writer: &'w mut CompactedIndexWriter) -> Self {
        Self {
            survivors,
            natural_index: 0,
            writer,
            written: 0,
        }
    }
}

impl Reducer<CompactedIndexEntry> for IndexFilteredCopyReducer<'_> {
    type Summary = u64;

    async fn step(&mut self, entry: CompactedIndexEntry) -> Result<StopIteration, StorageError> {
        let keep = self.survivors.contains(self.natural_index);
        self.natural_index += 1;
        if keep {
            self.writer.index(&entry.key, entry.offset, entry.delta).await?;
            self.written += 1;
        }
        Ok(StopIteration::No)
    }

    fn end_of_stream(self) -> u64 {
        self.written
    }
}

// ============================================================================
// Offset list pass
// ============================================================================

/// Collects the absolute offsets of every entry into a 64-bit bitmap.
#[derive(Debug, Default)]
pub struct CompactedOffsetListReducer {
    offsets: RoaringTreemap,
}

impl CompactedOffsetListReducer {
    /// Reducer with an empty offset list.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reducer<CompactedIndexEntry> for CompactedOffsetListReducer {
    type Summary = RoaringTreemap;

    async fn step(&mut self, entry: CompactedIndexEntry) -> Result<StopIteration, StorageError> {
        let offset = entry.absolute_offset();
        match u64::try_from(offset.as_i64()) {
            Ok(value) => {
                self.offsets.insert(value);
            }
            Err(_) => tracing::debug!(%offset, "ignoring negative compacted offset"),
        }
        Ok(StopIteration::No)
    }

    fn end_of_stream(self) -> RoaringTreemap {
        self.offsets
    }
}

/// Whether `offset` is in an offset list built by [`CompactedOffsetListReducer`].
pub fn contains_offset(offsets: &RoaringTreemap, offset: Offset) -> bool {
    u64::try_from(offset.as_i64()).is_ok_and(|value| offsets.contains(value))
}
