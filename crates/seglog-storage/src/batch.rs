//! Record batches: the unit of append, cache and compaction.
//!
//! A batch is a fixed header followed by its records section. Records carry
//! offsets and timestamps as deltas from the header's base values.
//!
//! # Batch Format
//!
//! ```text
//! [header_crc:u32][size_bytes:i32][base_offset:i64][crc:u32][attrs:i16][last_offset_delta:i32]
//! [first_timestamp:i64][max_timestamp:i64][producer_id:i64][producer_epoch:i16]
//! [base_sequence:i32][record_count:i32][records...]
//! ```
//!
//! All integers are little-endian. `crc` covers everything from `attrs` to
//! the end of the records section; `header_crc` covers the header after its
//! own field, so `crc` must be filled in first.
//!
//! # Record Format
//!
//! ```text
//! [length:u32][attrs:u8][timestamp_delta:i64][offset_delta:i32][key_len:i32][key][value_len:i32][value]
//! ```
//!
//! `length` counts the bytes after itself. A length of `-1` for key or value
//! encodes `None`.

use std::fmt::{self, Display};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use seglog_io::SegmentAppender;
use seglog_types::{CompressionKind, Offset, Timestamp, TimestampType};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::StorageError;
use crate::codec::CodecRegistry;

/// Encoded size of a batch header.
pub const HEADER_SIZE: usize = 60;

/// Per-record bytes besides key and value.
pub const RECORD_OVERHEAD: usize = 4 + 1 + 8 + 4 + 4 + 4;

// Start of the region covered by the batch crc (the attrs field).
const CRC_REGION_START: usize = 20;

const COMPRESSION_MASK: i16 = 0x07;
const LOG_APPEND_TIME_FLAG: i16 = 0x08;

// ============================================================================
// Header
// ============================================================================

/// Fixed-size batch header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatchHeader {
    pub header_crc: u32,
    /// Encoded size of the whole batch, header included.
    pub size_bytes: i32,
    pub base_offset: Offset,
    pub crc: u32,
    pub compression: CompressionKind,
    pub timestamp_type: TimestampType,
    pub last_offset_delta: i32,
    pub first_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub record_count: i32,
}

impl RecordBatchHeader {
    pub fn last_offset(&self) -> Offset {
        self.base_offset.with_delta(self.last_offset_delta)
    }

    /// Packs compression and timestamp type into the attrs field.
    pub fn attributes(&self) -> i16 {
        let mut attrs = i16::from(self.compression.as_byte()) & COMPRESSION_MASK;
        if self.timestamp_type == TimestampType::LogAppendTime {
            attrs |= LOG_APPEND_TIME_FLAG;
        }
        attrs
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_u32_le(self.header_crc);
        buf.put_i32_le(self.size_bytes);
        buf.put_i64_le(self.base_offset.as_i64());
        buf.put_u32_le(self.crc);
        buf.put_i16_le(self.attributes());
        buf.put_i32_le(self.last_offset_delta);
        buf.put_i64_le(self.first_timestamp.as_millis());
        buf.put_i64_le(self.max_timestamp.as_millis());
        buf.put_i64_le(self.producer_id);
        buf.put_i16_le(self.producer_epoch);
        buf.put_i32_le(self.base_sequence);
        buf.put_i32_le(self.record_count);
    }

    /// Parses a header without verifying either checksum.
    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < HEADER_SIZE {
            return Err(StorageError::UnexpectedEof);
        }
        let mut buf = &data[..HEADER_SIZE];
        let header_crc = buf.get_u32_le();
        let size_bytes = buf.get_i32_le();
        let base_offset = Offset::new(buf.get_i64_le());
        let crc = buf.get_u32_le();
        let attrs = buf.get_i16_le();

        let compression_byte = (attrs & COMPRESSION_MASK) as u8;
        let compression = CompressionKind::from_byte(compression_byte).ok_or(
            StorageError::InvalidCompressionKind {
                byte: compression_byte,
                offset: base_offset,
            },
        )?;
        let timestamp_type = if attrs & LOG_APPEND_TIME_FLAG != 0 {
            TimestampType::LogAppendTime
        } else {
            TimestampType::CreateTime
        };

        Ok(Self {
            header_crc,
            size_bytes,
            base_offset,
            crc,
            compression,
            timestamp_type,
            last_offset_delta: buf.get_i32_le(),
            first_timestamp: Timestamp::new(buf.get_i64_le()),
            max_timestamp: Timestamp::new(buf.get_i64_le()),
            producer_id: buf.get_i64_le(),
            producer_epoch: buf.get_i16_le(),
            base_sequence: buf.get_i32_le(),
            record_count: buf.get_i32_le(),
        })
    }

    /// Checksum over the header bytes that follow `header_crc`.
    pub fn compute_header_crc(&self) -> u32 {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode_into(&mut buf);
        crc32fast::hash(&buf[4..])
    }
}

impl Display for RecordBatchHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{base_offset:{}, last_offset:{}, records:{}, size:{}, compression:{}, timestamp_type:{}}}",
            self.base_offset,
            self.last_offset(),
            self.record_count,
            self.size_bytes,
            self.compression,
            self.timestamp_type
        )
    }
}

// ============================================================================
// Records
// ============================================================================

/// A single record within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Record {
    pub attributes: u8,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl Record {
    pub fn new(offset_delta: i32, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            attributes: 0,
            timestamp_delta: 0,
            offset_delta,
            key,
            value,
        }
    }

    pub fn size_bytes(&self) -> usize {
        RECORD_OVERHEAD
            + self.key.as_ref().map_or(0, Bytes::len)
            + self.value.as_ref().map_or(0, Bytes::len)
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let size = self.size_bytes();
        buf.reserve(size);
        buf.put_u32_le((size - 4) as u32);
        buf.put_u8(self.attributes);
        buf.put_i64_le(self.timestamp_delta);
        buf.put_i32_le(self.offset_delta);
        put_optional(buf, self.key.as_ref());
        put_optional(buf, self.value.as_ref());
    }

    /// Decodes one record from the front of `data`, advancing it.
    pub fn decode(data: &mut Bytes, batch_offset: Offset) -> Result<Self, StorageError> {
        if data.remaining() < 4 {
            return Err(StorageError::UnexpectedEof);
        }
        let length = data.get_u32_le() as usize;
        if data.remaining() < length || length < RECORD_OVERHEAD - 4 {
            return Err(invalid(batch_offset, "record length exceeds batch"));
        }
        let mut body = data.split_to(length);

        let attributes = body.get_u8();
        let timestamp_delta = body.get_i64_le();
        let offset_delta = body.get_i32_le();
        let key = get_optional(&mut body, batch_offset)?;
        let value = get_optional(&mut body, batch_offset)?;
        if body.has_remaining() {
            return Err(invalid(batch_offset, "trailing bytes in record"));
        }

        Ok(Self {
            attributes,
            timestamp_delta,
            offset_delta,
            key,
            value,
        })
    }
}

fn put_optional(buf: &mut BytesMut, field: Option<&Bytes>) {
    match field {
        Some(bytes) => {
            buf.put_i32_le(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => buf.put_i32_le(-1),
    }
}

fn get_optional(body: &mut Bytes, batch_offset: Offset) -> Result<Option<Bytes>, StorageError> {
    if body.remaining() < 4 {
        return Err(invalid(batch_offset, "record field truncated"));
    }
    let len = body.get_i32_le();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if body.remaining() < len {
        return Err(invalid(batch_offset, "record field truncated"));
    }
    Ok(Some(body.split_to(len)))
}

fn invalid(offset: Offset, reason: &str) -> StorageError {
    StorageError::InvalidBatch {
        offset,
        reason: reason.to_string(),
    }
}

/// Records section of a batch.
///
/// Compressed payloads are kept opaque; nothing in the storage layer
/// rewrites them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Records {
    Uncompressed(Vec<Record>),
    Compressed(Bytes),
}

impl Records {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Uncompressed(records) => records.iter().map(Record::size_bytes).sum(),
            Self::Compressed(payload) => payload.len(),
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Uncompressed(records) => {
                for record in records {
                    record.encode_into(buf);
                }
            }
            Self::Compressed(payload) => buf.put_slice(payload),
        }
    }
}

// ============================================================================
// Batch
// ============================================================================

/// A header plus its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    header: RecordBatchHeader,
    records: Records,
}

impl RecordBatch {
    /// Assembles a batch from parts without touching size or checksums.
    pub fn new(header: RecordBatchHeader, records: Records) -> Self {
        Self { header, records }
    }

    pub fn header(&self) -> &RecordBatchHeader {
        &self.header
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn into_parts(self) -> (RecordBatchHeader, Records) {
        (self.header, self.records)
    }

    pub fn base_offset(&self) -> Offset {
        self.header.base_offset
    }

    pub fn last_offset(&self) -> Offset {
        self.header.last_offset()
    }

    pub fn record_count(&self) -> usize {
        self.header.record_count.max(0) as usize
    }

    pub fn compressed(&self) -> bool {
        self.header.compression != CompressionKind::None
    }

    /// Encoded size as recorded in the header.
    pub fn size_bytes(&self) -> usize {
        self.header.size_bytes.max(0) as usize
    }

    /// Checksum over attrs through the end of the records section.
    pub fn compute_crc(&self) -> u32 {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.records.encoded_len());
        self.header.encode_into(&mut buf);
        self.records.encode_into(&mut buf);
        crc32fast::hash(&buf[CRC_REGION_START..])
    }

    /// Recomputes size, batch crc and header crc, in that order.
    pub fn seal(&mut self) {
        self.header.size_bytes = (HEADER_SIZE + self.records.encoded_len()) as i32;
        self.header.crc = self.compute_crc();
        self.header.header_crc = self.header.compute_header_crc();
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.records.encoded_len());
        self.header.encode_into(&mut buf);
        self.records.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes and verifies a complete encoded batch.
    pub fn decode(data: Bytes) -> Result<Self, StorageError> {
        let header = RecordBatchHeader::decode(&data)?;
        verify_header_crc(&header, &data[..HEADER_SIZE])?;

        let size = usize::try_from(header.size_bytes)
            .ok()
            .filter(|size| *size >= HEADER_SIZE)
            .ok_or_else(|| invalid(header.base_offset, "size below header size"))?;
        if data.len() < size {
            return Err(StorageError::UnexpectedEof);
        }

        let computed = crc32fast::hash(&data[CRC_REGION_START..size]);
        if header.crc != computed {
            return Err(StorageError::BatchChecksumMismatch {
                offset: header.base_offset,
                stored: header.crc,
                computed,
            });
        }

        let mut body = data.slice(HEADER_SIZE..size);
        let records = if header.compression == CompressionKind::None {
            Records::Uncompressed(decode_records(&mut body, &header)?)
        } else {
            Records::Compressed(body)
        };
        Ok(Self { header, records })
    }

    /// Returns the records, decompressing them when needed.
    pub fn decompressed_records(&self, codecs: &CodecRegistry) -> Result<Vec<Record>, StorageError> {
        match &self.records {
            Records::Uncompressed(records) => Ok(records.clone()),
            Records::Compressed(payload) => {
                let mut body = codecs.get(self.header.compression).decompress(payload)?;
                decode_records(&mut body, &self.header)
            }
        }
    }
}

/// Checks `header` against the checksum of its `raw` encoding.
fn verify_header_crc(header: &RecordBatchHeader, raw: &[u8]) -> Result<(), StorageError> {
    let computed = crc32fast::hash(&raw[4..HEADER_SIZE]);
    if header.header_crc != computed {
        return Err(StorageError::HeaderChecksumMismatch {
            offset: header.base_offset,
            stored: header.header_crc,
            computed,
        });
    }
    Ok(())
}

fn decode_records(body: &mut Bytes, header: &RecordBatchHeader) -> Result<Vec<Record>, StorageError> {
    let count = usize::try_from(header.record_count)
        .map_err(|_| invalid(header.base_offset, "negative record count"))?;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(Record::decode(body, header.base_offset)?);
    }
    if body.has_remaining() {
        return Err(invalid(header.base_offset, "records section has trailing bytes"));
    }
    Ok(records)
}

// ============================================================================
// Builder
// ============================================================================

/// Builds sealed batches with consecutive offset deltas.
#[derive(Debug, Clone)]
pub struct RecordBatchBuilder {
    base_offset: Offset,
    first_timestamp: Timestamp,
    timestamp_type: TimestampType,
    append_time: Option<Timestamp>,
    compression: CompressionKind,
    producer_id: i64,
    producer_epoch: i16,
    base_sequence: i32,
    records: Vec<Record>,
}

impl RecordBatchBuilder {
    pub fn new(base_offset: Offset) -> Self {
        Self {
            base_offset,
            first_timestamp: Timestamp::MISSING,
            timestamp_type: TimestampType::CreateTime,
            append_time: None,
            compression: CompressionKind::None,
            producer_id: -1,
            producer_epoch: -1,
            base_sequence: -1,
            records: Vec::new(),
        }
    }

    pub fn with_first_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.first_timestamp = timestamp;
        self
    }

    /// Marks the batch as broker-timestamped with the given max timestamp.
    pub fn with_log_append_time(mut self, timestamp: Timestamp) -> Self {
        self.timestamp_type = TimestampType::LogAppendTime;
        self.append_time = Some(timestamp);
        self
    }

    pub fn with_compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_producer(mut self, producer_id: i64, producer_epoch: i16, base_sequence: i32) -> Self {
        self.producer_id = producer_id;
        self.producer_epoch = producer_epoch;
        self.base_sequence = base_sequence;
        self
    }

    /// Appends a keyed record with a zero timestamp delta.
    pub fn add_record(self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.add_record_at(0, Some(key.into()), Some(value.into()))
    }

    pub fn add_record_at(mut self, timestamp_delta: i64, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        let mut record = Record::new(self.records.len() as i32, key, value);
        record.timestamp_delta = timestamp_delta;
        self.records.push(record);
        self
    }

    pub fn build(self) -> Result<RecordBatch, StorageError> {
        self.build_with(&CodecRegistry::new())
    }

    pub fn build_with(self, codecs: &CodecRegistry) -> Result<RecordBatch, StorageError> {
        let Some(last) = self.records.last() else {
            return Err(invalid(self.base_offset, "batch has no records"));
        };
        let last_offset_delta = last.offset_delta;

        let max_timestamp = match self.append_time {
            Some(append_time) => append_time,
            None => {
                let max_delta = self.records.iter().map(|r| r.timestamp_delta).max().unwrap_or(0);
                self.first_timestamp.with_delta(max_delta)
            }
        };

        let record_count = self.records.len() as i32;
        let records = if self.compression == CompressionKind::None {
            Records::Uncompressed(self.records)
        } else {
            let mut raw = BytesMut::new();
            Records::Uncompressed(self.records).encode_into(&mut raw);
            Records::Compressed(codecs.get(self.compression).compress(&raw)?)
        };

        let header = RecordBatchHeader {
            header_crc: 0,
            size_bytes: 0,
            base_offset: self.base_offset,
            crc: 0,
            compression: self.compression,
            timestamp_type: self.timestamp_type,
            last_offset_delta,
            first_timestamp: self.first_timestamp,
            max_timestamp,
            producer_id: self.producer_id,
            producer_epoch: self.producer_epoch,
            base_sequence: self.base_sequence,
            record_count,
        };
        let mut batch = RecordBatch::new(header, records);
        batch.seal();
        Ok(batch)
    }
}

// ============================================================================
// Stream I/O
// ============================================================================

/// Writes an encoded batch through an appender.
pub async fn write(appender: &mut SegmentAppender, batch: &RecordBatch) -> Result<(), StorageError> {
    appender.append(&batch.encode()).await?;
    Ok(())
}

/// Reads consecutive batches from a byte stream.
#[derive(Debug)]
pub struct BatchReader<R> {
    inner: R,
    position: u64,
}

impl<R: AsyncRead + Unpin> BatchReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next batch, or `None` on a clean end of stream.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>, StorageError> {
        let mut header = [0u8; HEADER_SIZE];
        let filled = self.fill(&mut header).await?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_SIZE {
            return Err(StorageError::UnexpectedEof);
        }

        // The size field is untrusted until the header checksum matches.
        let parsed = RecordBatchHeader::decode(&header)?;
        verify_header_crc(&parsed, &header)?;
        let size = usize::try_from(parsed.size_bytes)
            .ok()
            .filter(|size| *size >= HEADER_SIZE)
            .ok_or_else(|| invalid(parsed.base_offset, "size below header size"))?;

        let mut buf = BytesMut::zeroed(size);
        buf[..HEADER_SIZE].copy_from_slice(&header);
        self.inner
            .read_exact(&mut buf[HEADER_SIZE..])
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => StorageError::UnexpectedEof,
                _ => StorageError::Fs(e),
            })?;

        self.position += size as u64;
        RecordBatch::decode(buf.freeze()).map(Some)
    }

    /// Skips batches that end before `offset`.
    pub async fn seek_to(&mut self, offset: Offset) -> Result<Option<RecordBatch>, StorageError> {
        while let Some(batch) = self.next_batch().await? {
            if batch.last_offset() >= offset {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
