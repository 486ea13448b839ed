//! Positioned read access to a segment's data file.
//!
//! A [`SegmentReader`] never holds a file descriptor between calls. Each
//! [`SegmentReader::data_stream`] opens the file, seeks to the requested byte
//! position and returns a buffered stream bounded by the reader's *visible*
//! file size. The visible size only moves forward when the owning segment
//! flushes, so a stream never exposes bytes that are not yet durable.

use std::fmt::Display;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use seglog_types::IoPriority;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader, Take};

use crate::IoError;

/// Default buffer size for read streams (128 KiB).
const DEFAULT_READ_BUFFER: usize = 128 * 1024;

/// A positioned, size-bounded byte stream over a segment file.
pub type DataStream = Take<BufReader<File>>;

/// Read side of a segment's data file.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
    /// Bytes visible to readers. Trails the physical size while writes are
    /// buffered or not yet flushed.
    file_size: u64,
    buffer_size: usize,
    closed: bool,
}

impl SegmentReader {
    /// Opens a reader over an existing file, exposing its current size.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, IoError> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| IoError::from_open(e, &path))?;

        Ok(Self {
            path,
            file_size: metadata.len(),
            buffer_size: DEFAULT_READ_BUFFER,
            closed: false,
        })
    }

    /// Overrides the read buffer size used by new streams.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Returns the path of the underlying file.
    pub fn filename(&self) -> &Path {
        &self.path
    }

    /// Returns the number of bytes visible to readers.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Updates the number of bytes visible to readers.
    pub fn set_file_size(&mut self, size: u64) {
        self.file_size = size;
    }

    /// Returns a stream starting at `position` and ending at the visible size.
    pub async fn data_stream(
        &self,
        position: u64,
        priority: IoPriority,
    ) -> Result<DataStream, IoError> {
        if self.closed {
            return Err(IoError::Closed {
                path: self.path.clone(),
            });
        }

        let mut file = File::open(&self.path)
            .await
            .map_err(|e| IoError::from_open(e, &self.path))?;
        file.seek(SeekFrom::Start(position)).await?;

        tracing::trace!(
            path = %self.path.display(),
            position,
            visible = self.file_size,
            %priority,
            "opening data stream"
        );

        let remaining = self.file_size.saturating_sub(position);
        Ok(BufReader::with_capacity(self.buffer_size, file).take(remaining))
    }

    /// Shortens the file on disk to `physical` bytes.
    pub async fn truncate(&mut self, physical: u64) -> Result<(), IoError> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| IoError::from_open(e, &self.path))?;
        file.set_len(physical).await?;
        file.sync_all().await?;
        self.file_size = physical;
        Ok(())
    }

    /// Marks the reader closed. Streams that are already open stay valid.
    pub async fn close(&mut self) -> Result<(), IoError> {
        self.closed = true;
        Ok(())
    }
}

impl Display for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{path:{}, file_size:{}, closed:{}}}",
            self.path.display(),
            self.file_size,
            self.closed
        )
    }
}
