//! Offset bookkeeping for a single segment.

use std::fmt::{self, Display};

use seglog_types::{Offset, Term};

/// Offsets a segment has accepted and made durable.
///
/// `dirty_offset` is the last offset appended; `committed_offset` is the
/// last offset a flush has made durable. Once data is written,
/// `base_offset <= committed_offset <= dirty_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetTracker {
    pub term: Term,
    pub base_offset: Offset,
    pub committed_offset: Offset,
    pub dirty_offset: Offset,
}

impl OffsetTracker {
    pub fn new(term: Term, base_offset: Offset) -> Self {
        Self {
            term,
            base_offset,
            committed_offset: base_offset,
            dirty_offset: base_offset,
        }
    }

    /// Appended data has not been made durable yet.
    pub fn has_unflushed(&self) -> bool {
        self.dirty_offset > self.committed_offset
    }
}

impl Display for OffsetTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{term:{}, base_offset:{}, committed_offset:{}, dirty_offset:{}}}",
            self.term, self.base_offset, self.committed_offset, self.dirty_offset
        )
    }
}
