//! # seglog-io: Segment file primitives
//!
//! This crate provides the physical I/O a segment is built on:
//!
//! - **[`SegmentReader`]**: positioned, size-bounded read streams
//! - **[`SegmentAppender`]**: buffered append-only writer with explicit flush
//! - **[`remove_file`]**: best-effort removal used for tombstoned segments
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │      seglog-storage      │
//! │ (segment, compaction)    │
//! └────────────┬─────────────┘
//!              │
//! ┌────────────┴─────────────┐
//! │        seglog-io         │
//! │  ┌────────┐  ┌────────┐  │
//! │  │ Reader │  │Appender│  │
//! │  └────────┘  └────────┘  │
//! └──────────────────────────┘
//! ```
//!
//! All operations are `async` on the tokio runtime; suspension happens only
//! at file reads, writes, syncs, truncations and removals.

mod appender;
mod error;
mod reader;

use std::path::Path;

pub use appender::{DEFAULT_WRITE_BEHIND, SegmentAppender};
pub use error::IoError;
pub use reader::{DataStream, SegmentReader};

/// Removes a file from disk.
pub async fn remove_file(path: impl AsRef<Path>) -> Result<(), IoError> {
    let path = path.as_ref();
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| IoError::from_open(e, path))
}
