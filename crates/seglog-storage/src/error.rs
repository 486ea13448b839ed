//! Storage error types.

use seglog_io::IoError;
use seglog_types::Offset;

/// Errors from segments, batch decoding and compaction.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failure in the reader, appender or file removal primitives.
    #[error(transparent)]
    Io(#[from] IoError),

    /// Failure from direct filesystem access (index files).
    #[error("filesystem error: {0}")]
    Fs(#[from] std::io::Error),

    /// An operation was attempted after `close()`.
    #[error("attempted to perform operation '{operation}' on a closed segment: {segment}")]
    SegmentClosed {
        operation: &'static str,
        segment: String,
    },

    /// The stream ended in the middle of a batch or index entry.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The header checksum does not match the header contents.
    #[error(
        "batch header checksum mismatch at offset {offset}: stored {stored:#010x}, computed {computed:#010x}"
    )]
    HeaderChecksumMismatch {
        offset: Offset,
        stored: u32,
        computed: u32,
    },

    /// The batch checksum does not match the batch contents.
    #[error(
        "batch checksum mismatch at offset {offset}: stored {stored:#010x}, computed {computed:#010x}"
    )]
    BatchChecksumMismatch {
        offset: Offset,
        stored: u32,
        computed: u32,
    },

    /// A structurally invalid batch or record.
    #[error("invalid batch at offset {offset}: {reason}")]
    InvalidBatch { offset: Offset, reason: String },

    /// Attributes name a compression codec this build does not know.
    #[error("invalid compression kind {byte} at offset {offset}")]
    InvalidCompressionKind { byte: u8, offset: Offset },

    #[error("compression failed ({codec}): {reason}")]
    CompressionFailed { codec: &'static str, reason: String },

    #[error("decompression failed ({codec}): {reason}")]
    DecompressionFailed { codec: &'static str, reason: String },

    /// Index file does not start with the expected magic bytes.
    #[error("invalid index file magic bytes")]
    InvalidIndexMagic,

    #[error("unsupported index file version: {0}")]
    UnsupportedIndexVersion(u8),

    #[error("index file truncated: expected {expected} bytes, found {actual}")]
    IndexTruncated { expected: usize, actual: usize },

    #[error("index checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    IndexChecksumMismatch { stored: u32, computed: u32 },
}
