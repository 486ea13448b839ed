//! Rewrites a segment's batches into a new segment, keeping only chosen
//! records.

use std::sync::Arc;

use seglog_types::{Offset, TimestampType};

use crate::StorageError;
use crate::batch::{Record, RecordBatch, Records};
use crate::compaction::reducers::{Reducer, StopIteration};
use crate::observer::StorageObserver;
use crate::segment::Segment;

/// Counters reported by [`CopyDataSegmentReducer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Batches appended unchanged.
    pub batches_kept: u64,
    /// Batches appended with some records removed.
    pub batches_rewritten: u64,
    /// Batches with no surviving record.
    pub batches_dropped: u64,
    pub compressed_skipped: u64,
    pub records_written: u64,
    pub bytes_written: u64,
}

/// Filters batches record by record and appends the result to `target`.
///
/// `should_keep(base_offset, offset_delta)` decides each record. Base
/// offset and last offset delta of a rewritten batch are preserved, so
/// offsets in the new segment match the old one.
pub struct CopyDataSegmentReducer<'a, F> {
    should_keep: F,
    target: &'a Segment,
    observer: Arc<dyn StorageObserver>,
    stats: CopyStats,
}

impl<'a, F> CopyDataSegmentReducer<'a, F>
where
    F: Fn(Offset, i32) -> bool,
{
    pub fn new(should_keep: F, target: &'a Segment, observer: Arc<dyn StorageObserver>) -> Self {
        Self {
            should_keep,
            target,
            observer,
            stats: CopyStats::default(),
        }
    }

    /// Applies `should_keep` to an uncompressed batch.
    ///
    /// Returns `None` when no record survives, the batch itself when all do,
    /// and otherwise the survivors resealed with a new size and checksums.
    pub fn filter(&self, batch: RecordBatch) -> Option<RecordBatch> {
        let (header, records) = batch.into_parts();
        let Records::Uncompressed(records) = records else {
            return Some(RecordBatch::new(header, records));
        };

        let total = records.len();
        let kept: Vec<Record> = records
            .iter()
            .filter(|record| (self.should_keep)(header.base_offset, record.offset_delta))
            .cloned()
            .collect();

        if kept.is_empty() {
            return None;
        }
        if kept.len() == total {
            return Some(RecordBatch::new(header, Records::Uncompressed(records)));
        }

        let first_delta = kept.first().map_or(0, |r| r.timestamp_delta);
        let last_delta = kept.last().map_or(0, |r| r.timestamp_delta);

        let mut rewritten = header.clone();
        rewritten.first_timestamp = header.first_timestamp.with_delta(first_delta);
        if header.timestamp_type == TimestampType::CreateTime {
            rewritten.max_timestamp = header.first_timestamp.with_delta(last_delta);
        }
        rewritten.record_count = kept.len() as i32;

        let mut batch = RecordBatch::new(rewritten, Records::Uncompressed(kept));
        batch.seal();
        Some(batch)
    }
}

impl<F> Reducer<RecordBatch> for CopyDataSegmentReducer<'_, F>
where
    F: Fn(Offset, i32) -> bool,
{
    type Summary = CopyStats;

    async fn step(&mut self, batch: RecordBatch) -> Result<StopIteration, StorageError> {
        if batch.compressed() {
            self.observer.compressed_batch_skipped(batch.header());
            self.stats.compressed_skipped += 1;
            return Ok(StopIteration::No);
        }

        let records = batch.record_count();
        let Some(filtered) = self.filter(batch) else {
            self.stats.batches_dropped += 1;
            return Ok(StopIteration::No);
        };

        if filtered.record_count() == records {
            self.stats.batches_kept += 1;
        } else {
            self.stats.batches_rewritten += 1;
        }
        let appended = self.target.append(&filtered).await?;
        self.stats.records_written += filtered.record_count() as u64;
        self.stats.bytes_written += appended.byte_size as u64;
        Ok(StopIteration::No)
    }

    fn end_of_stream(self) -> CopyStats {
        self.stats
    }
}

impl<F> std::fmt::Debug for CopyDataSegmentReducer<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CopyDataSegmentReducer")
            .field("target", &self.target.name())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
