//! # seglog-types: Core types for `seglog`
//!
//! Shared value types used across the segment storage layer:
//! - Log positions ([`Offset`], [`Term`])
//! - Temporal types ([`Timestamp`], [`TimestampType`])
//! - Batch encoding ([`CompressionKind`])
//! - Read scheduling ([`IoPriority`])

use std::{
    fmt::{Debug, Display},
    ops::{Add, AddAssign, Sub},
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Log positions - All Copy (cheap 8-byte values)
// ============================================================================

/// Logical position of a record within a log.
///
/// Offsets are assigned sequentially by the producer of a log. A segment's
/// records occupy a contiguous range of offsets starting at its base offset.
///
/// Uses `i64` internally so that "no offset yet" can be expressed as
/// [`Offset::NONE`], which sorts before every valid offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Offset(i64);

impl Offset {
    pub const ZERO: Offset = Offset(0);

    /// Sentinel for "no offset", one before the first valid offset.
    pub const NONE: Offset = Offset(-1);

    pub fn new(offset: i64) -> Self {
        Self(offset)
    }

    /// Returns the offset as an `i64`.
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the offset immediately after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns `self + delta`, where `delta` is an intra-batch record delta.
    pub fn with_delta(self, delta: i32) -> Self {
        Self(self.0 + i64::from(delta))
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Offset {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Offset {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Offset {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Offset> for i64 {
    fn from(offset: Offset) -> Self {
        offset.0
    }
}

/// Leadership term under which a segment was written.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Term(i64);

impl Term {
    pub fn new(term: i64) -> Self {
        Self(term)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// ============================================================================
// Temporal types
// ============================================================================

/// Milliseconds since the Unix epoch, as carried in batch headers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Value used when a batch carries no timestamp.
    pub const MISSING: Timestamp = Timestamp(-1);

    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns this timestamp shifted by a record's timestamp delta.
    pub fn with_delta(self, delta: i64) -> Self {
        Self(self.0 + delta)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Who assigned a batch's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TimestampType {
    /// Timestamps were set by the producer when records were created.
    #[default]
    CreateTime,
    /// The max timestamp was assigned by the broker on append and cannot
    /// be derived from the records.
    LogAppendTime,
}

impl Display for TimestampType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateTime => write!(f, "create_time"),
            Self::LogAppendTime => write!(f, "log_append_time"),
        }
    }
}

// ============================================================================
// Batch encoding
// ============================================================================

/// Compression applied to the records section of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum CompressionKind {
    /// No compression (default).
    #[default]
    None = 0,
    /// LZ4 compression (fast, moderate ratio).
    Lz4 = 1,
    /// Zstandard compression (slower, better ratio).
    Zstd = 2,
}

impl CompressionKind {
    /// Returns the discriminant stored in batch attributes.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Creates a `CompressionKind` from its byte discriminant.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }
}

impl Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Lz4 => write!(f, "lz4"),
            Self::Zstd => write!(f, "zstd"),
        }
    }
}

// ============================================================================
// Read scheduling
// ============================================================================

/// Priority class attached to a read stream.
///
/// Carried through to the reader so that callers can distinguish
/// foreground fetches from background compaction scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IoPriority(u8);

impl IoPriority {
    /// Client-facing reads.
    pub const FOREGROUND: IoPriority = IoPriority(0);
    /// Compaction and recovery scans.
    pub const COMPACTION: IoPriority = IoPriority(1);

    pub fn new(class: u8) -> Self {
        Self(class)
    }

    pub fn class(&self) -> u8 {
        self.0
    }
}

impl Display for IoPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "priority-{}", self.0)
    }
}
