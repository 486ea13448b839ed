//! Hooks for segment lifecycle events.
//!
//! Segments and compaction report through a [`StorageObserver`] instead of
//! logging directly. [`TracingObserver`] forwards every event to `tracing`.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use seglog_io::IoError;
use seglog_types::Offset;

use crate::batch::RecordBatchHeader;

/// Receives segment and compaction events. Every method defaults to a no-op.
pub trait StorageObserver: Send + Sync + Debug {
    fn segment_closed(&self, _segment: &str) {}

    fn segment_truncated(&self, _segment: &str, _prev_last_offset: Offset, _physical: u64) {}

    fn removing_tombstone(&self, _files: &[PathBuf]) {}

    fn tombstone_removal_failed(&self, _file: &Path, _error: &IoError) {}

    /// A compressed batch reached the compaction copy stage and was left out.
    fn compressed_batch_skipped(&self, _header: &RecordBatchHeader) {}
}

/// Observer that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StorageObserver for NoopObserver {}

/// Observer that logs events with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StorageObserver for TracingObserver {
    fn segment_closed(&self, segment: &str) {
        tracing::debug!(segment, "segment closed");
    }

    fn segment_truncated(&self, segment: &str, prev_last_offset: Offset, physical: u64) {
        tracing::info!(
            segment,
            prev_last_offset = %prev_last_offset,
            physical,
            "segment truncated"
        );
    }

    fn removing_tombstone(&self, files: &[PathBuf]) {
        tracing::info!(?files, "removing tombstoned segment files");
    }

    fn tombstone_removal_failed(&self, file: &Path, error: &IoError) {
        tracing::warn!(file = %file.display(), %error, "failed to remove tombstoned file");
    }

    fn compressed_batch_skipped(&self, header: &RecordBatchHeader) {
        tracing::error!(
            %header,
            "compaction skips compressed batches; batch left out of the rewritten segment"
        );
    }
}
