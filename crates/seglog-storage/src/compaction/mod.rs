//! Key compaction for a single segment.
//!
//! - [`index`]: the compacted index file written next to a segment
//! - [`reducers`]: streaming passes over compacted index entries
//! - [`copy`]: the pass that rewrites batches into a new segment
//! - [`pipeline`]: drivers composing the passes

pub mod copy;
pub mod index;
pub mod pipeline;
pub mod reducers;

pub use copy::{CopyDataSegmentReducer, CopyStats};
pub use index::{
    CompactedIndexEntry, CompactedIndexFooter, CompactedIndexReader, CompactedIndexWriter,
    EntryType,
};
pub use pipeline::{
    CompactionStats, compact_segment, compacted_offsets, compute_survivors, rewrite_segment,
    write_filtered_index,
};
pub use reducers::{
    CompactedOffsetListReducer, CompactionKeyReducer, IndexFilteredCopyReducer, Reducer,
    StopIteration, TruncationOffsetReducer, consume_batches, consume_index,
};
