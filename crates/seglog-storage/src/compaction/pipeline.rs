//! End-to-end self-compaction of a single segment.
//!
//! ```text
//! compacted index ──truncation pass──▶ live entries
//!                 ──key pass─────────▶ survivors
//!                 ──filtered copy────▶ new compacted index
//! new index       ──offset list──────▶ surviving offsets
//! source segment  ──batch copy───────▶ target segment
//! ```

use std::path::Path;
use std::sync::Arc;

use roaring::{RoaringBitmap, RoaringTreemap};
use seglog_config::CompactionConfig;
use seglog_types::IoPriority;

use crate::StorageError;
use crate::batch::BatchReader;
use crate::compaction::copy::{CopyDataSegmentReducer, CopyStats};
use crate::compaction::index::{CompactedIndexFooter, CompactedIndexReader, CompactedIndexWriter};
use crate::compaction::reducers::{
    CompactedOffsetListReducer, CompactionKeyReducer, IndexFilteredCopyReducer,
    TruncationOffsetReducer, consume_batches, consume_index, contains_offset,
};
use crate::observer::StorageObserver;
use crate::segment::Segment;

/// Counters from one [`compact_segment`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Entries in the source compacted index.
    pub entries_scanned: u64,
    /// Entries written to the filtered compacted index.
    pub entries_retained: u64,
    pub copy: CopyStats,
}

/// Natural indices of the entries that survive truncation and key
/// deduplication.
pub async fn compute_survivors(
    index_path: &Path,
    config: &CompactionConfig,
) -> Result<RoaringBitmap, StorageError> {
    let mut reader = CompactedIndexReader::open(index_path).await?;
    let live = consume_index(&mut reader, TruncationOffsetReducer::new()).await?;

    reader.rewind();
    let reducer = CompactionKeyReducer::from_config(config, Some(live));
    consume_index(&mut reader, reducer).await
}

/// Copies the `survivors` of the index at `source` into a new index at
/// `target`.
pub async fn write_filtered_index(
    source: &Path,
    target: &Path,
    survivors: RoaringBitmap,
) -> Result<CompactedIndexFooter, StorageError> {
    let mut reader = CompactedIndexReader::open(source).await?;
    let mut writer = CompactedIndexWriter::create(target).await?;
    let written = consume_index(&mut reader, IndexFilteredCopyReducer::new(survivors, &mut writer)).await?;

    let footer = writer.close().await?;
    debug_assert_eq!(footer.entries, written, "footer must count every copied entry");
    Ok(footer)
}

/// Absolute offsets named by every entry of a compacted index.
pub async fn compacted_offsets(index_path: &Path) -> Result<RoaringTreemap, StorageError> {
    let mut reader = CompactedIndexReader::open(index_path).await?;
    consume_index(&mut reader, CompactedOffsetListReducer::new()).await
}

/// Copies the records of `source` whose offsets are in `offsets` into
/// `target`, then flushes `target`.
pub async fn rewrite_segment(
    source: &Segment,
    target: &Segment,
    offsets: &RoaringTreemap,
    observer: Arc<dyn StorageObserver>,
) -> Result<CopyStats, StorageError> {
    let base_offset = source.offsets().await.base_offset;
    let stream = source
        .offset_data_stream(base_offset, IoPriority::COMPACTION)
        .await?;
    let mut batches = BatchReader::new(stream);

    let reducer = CopyDataSegmentReducer::new(
        |base, delta| contains_offset(offsets, base.with_delta(delta)),
        target,
        observer,
    );
    let stats = consume_batches(&mut batches, reducer).await?;
    target.flush().await?;
    Ok(stats)
}

/// Runs every compaction pass over `source`, writing the filtered compacted
/// index to `target_index` and the surviving records to `target`.
pub async fn compact_segment(
    source: &Segment,
    source_index: &Path,
    target: &Segment,
    target_index: &Path,
    config: &CompactionConfig,
    observer: Arc<dyn StorageObserver>,
) -> Result<CompactionStats, StorageError> {
    let entries_scanned = CompactedIndexReader::open(source_index).await?.len();
    let survivors = compute_survivors(source_index, config).await?;
    let footer = write_filtered_index(source_index, target_index, survivors).await?;
    let offsets = compacted_offsets(target_index).await?;
    let copy = rewrite_segment(source, target, &offsets, observer).await?;

    tracing::debug!(
        segment = source.name(),
        entries_scanned,
        entries_retained = footer.entries,
        records_written = copy.records_written,
        "segment compacted"
    );

    Ok(CompactionStats {
        entries_scanned,
        entries_retained: footer.entries,
        copy,
    })
}
