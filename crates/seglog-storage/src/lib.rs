//! # seglog-storage: Log segments and key compaction
//!
//! A [`Segment`] owns one data file of record batches together with its
//! sparse [`SegmentIndex`], an optional [`SegmentAppender`] for the
//! segment being written, and an optional [`BatchCache`] of recent
//! batches.
//!
//! The [`compaction`] module rewrites a segment so that only the newest
//! record per key survives, driven by the segment's compacted index.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Segment                    │
//! │  ┌─────────┐ ┌──────────┐ ┌───────┐ ┌─────┐  │
//! │  │ Tracker │ │ Appender │ │ Index │ │Cache│  │
//! │  └─────────┘ └──────────┘ └───────┘ └─────┘  │
//! └──────────────────────┬───────────────────────┘
//!                        │ data stream
//! ┌──────────────────────┴───────────────────────┐
//! │  BatchReader ──▶ reducers ──▶ new Segment    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Storage events are reported through a [`StorageObserver`];
//! [`TracingObserver`] is the default.
//!
//! [`SegmentAppender`]: seglog_io::SegmentAppender

pub mod batch;
pub mod cache;
pub mod codec;
pub mod compaction;
mod error;
pub mod index;
pub mod observer;
pub mod segment;
pub mod tracker;

pub use batch::{BatchReader, Record, RecordBatch, RecordBatchBuilder, RecordBatchHeader, Records};
pub use cache::BatchCache;
pub use codec::CodecRegistry;
pub use error::StorageError;
pub use index::{IndexEntry, SegmentIndex};
pub use observer::{NoopObserver, StorageObserver, TracingObserver};
pub use segment::{AppendResult, Segment, create_segment, index_path, open_segment, segment_path};
pub use tracker::OffsetTracker;

#[cfg(test)]
mod tests;
