//! Compression codecs for the records section of a batch.
//!
//! The storage layer never rewrites compressed batches; codecs exist so the
//! batch builder can produce them and readers can inspect their contents.

use bytes::Bytes;
use seglog_types::CompressionKind;

use crate::StorageError;

/// A compression/decompression codec for batch payloads.
pub trait Codec: Send + Sync {
    fn kind(&self) -> CompressionKind;

    fn compress(&self, input: &[u8]) -> Result<Bytes, StorageError>;

    fn decompress(&self, input: &[u8]) -> Result<Bytes, StorageError>;
}

/// Passthrough codec for [`CompressionKind::None`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoneCodec;

impl Codec for NoneCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes, StorageError> {
        Ok(Bytes::copy_from_slice(input))
    }

    fn decompress(&self, input: &[u8]) -> Result<Bytes, StorageError> {
        Ok(Bytes::copy_from_slice(input))
    }
}

/// LZ4 block codec with a size prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lz4
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes, StorageError> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(input)))
    }

    fn decompress(&self, input: &[u8]) -> Result<Bytes, StorageError> {
        lz4_flex::decompress_size_prepended(input)
            .map(Bytes::from)
            .map_err(|e| StorageError::DecompressionFailed {
                codec: "lz4",
                reason: e.to_string(),
            })
    }
}

/// Zstandard codec.
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Zstd
    }

    fn compress(&self, input: &[u8]) -> Result<Bytes, StorageError> {
        zstd::encode_all(input, self.level)
            .map(Bytes::from)
            .map_err(|e| StorageError::CompressionFailed {
                codec: "zstd",
                reason: e.to_string(),
            })
    }

    fn decompress(&self, input: &[u8]) -> Result<Bytes, StorageError> {
        zstd::decode_all(input)
            .map(Bytes::from)
            .map_err(|e| StorageError::DecompressionFailed {
                codec: "zstd",
                reason: e.to_string(),
            })
    }
}

/// Looks up the codec named by a batch's attributes.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    none: NoneCodec,
    lz4: Lz4Codec,
    zstd: ZstdCodec,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zstd_level(level: i32) -> Self {
        Self {
            zstd: ZstdCodec { level },
            ..Self::default()
        }
    }

    pub fn get(&self, kind: CompressionKind) -> &dyn Codec {
        match kind {
            CompressionKind::None => &self.none,
            CompressionKind::Lz4 => &self.lz4,
            CompressionKind::Zstd => &self.zstd,
        }
    }
}
