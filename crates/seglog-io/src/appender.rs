//! Append-only writer for a segment's data file.
//!
//! Writes are staged in a write-behind buffer and spilled to the file once
//! the buffer reaches its threshold. [`SegmentAppender::file_byte_offset`]
//! counts staged bytes too, so it always equals the physical position the
//! next append will land at.
//!
//! A failed write leaves the file in an unknown state, so the appender is
//! poisoned: the failing append is un-staged and every later call fails
//! with [`IoError::Poisoned`].

use std::fmt::Display;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::IoError;

/// Default write-behind buffer size (64 KiB).
pub const DEFAULT_WRITE_BEHIND: usize = 64 * 1024;

/// Write side of a segment's data file.
#[derive(Debug)]
pub struct SegmentAppender {
    path: PathBuf,
    file: Option<File>,
    buffer: BytesMut,
    /// Bytes already handed to the file (not necessarily synced).
    written_bytes: u64,
    write_behind: usize,
    poisoned: bool,
}

impl SegmentAppender {
    /// Opens (creating if needed) `path` and positions at its end.
    pub async fn open(path: impl Into<PathBuf>, write_behind: usize) -> Result<Self, IoError> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| IoError::from_open(e, &path))?;
        let written_bytes = file.seek(SeekFrom::End(0)).await?;

        Ok(Self {
            path,
            file: Some(file),
            buffer: BytesMut::with_capacity(write_behind),
            written_bytes,
            write_behind,
            poisoned: false,
        })
    }

    /// Returns the path of the underlying file.
    pub fn filename(&self) -> &Path {
        &self.path
    }

    /// Physical byte position of the next append.
    pub fn file_byte_offset(&self) -> u64 {
        self.written_bytes + self.buffer.len() as u64
    }

    /// Returns true once a write to the file has failed.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Stages `data` for writing, spilling the buffer when it is full.
    ///
    /// On error `data` is not staged and `file_byte_offset` is unchanged.
    pub async fn append(&mut self, data: &[u8]) -> Result<(), IoError> {
        self.file()?;
        let staged = self.buffer.len();
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.write_behind
            && let Err(e) = self.spill().await
        {
            self.buffer.truncate(staged);
            return Err(e);
        }
        Ok(())
    }

    /// Writes staged bytes and syncs file data to stable storage.
    pub async fn flush(&mut self) -> Result<(), IoError> {
        self.spill().await?;
        let synced = self.file()?.sync_data().await;
        if let Err(e) = synced {
            return Err(self.poison(e));
        }
        Ok(())
    }

    /// Cuts the file to `physical` bytes, discarding anything staged past it.
    pub async fn truncate(&mut self, physical: u64) -> Result<(), IoError> {
        self.spill().await?;
        let file = self.file()?;
        file.set_len(physical).await?;
        file.seek(SeekFrom::Start(physical)).await?;
        file.sync_all().await?;
        self.written_bytes = physical;
        Ok(())
    }

    /// Flushes and releases the file. Further calls fail with `Closed`.
    pub async fn close(&mut self) -> Result<(), IoError> {
        self.flush().await?;
        self.file = None;
        Ok(())
    }

    async fn spill(&mut self) -> Result<(), IoError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let file = match self.file.as_mut() {
            Some(file) if !self.poisoned => file,
            _ => return Err(self.unavailable()),
        };
        if let Err(e) = file.write_all(&self.buffer).await {
            // Part of the buffer may have reached the file.
            return Err(self.poison(e));
        }
        self.written_bytes += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    fn poison(&mut self, err: std::io::Error) -> IoError {
        self.poisoned = true;
        self.file = None;
        err.into()
    }

    fn unavailable(&self) -> IoError {
        let path = self.path.clone();
        if self.poisoned {
            IoError::Poisoned { path }
        } else {
            IoError::Closed { path }
        }
    }

    fn file(&mut self) -> Result<&mut File, IoError> {
        if self.poisoned || self.file.is_none() {
            return Err(self.unavailable());
        }
        Ok(self.file.as_mut().expect("file presence checked above"))
    }
}

impl Display for SegmentAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{path:{}, file_byte_offset:{}, staged:{}}}",
            self.path.display(),
            self.file_byte_offset(),
            self.buffer.len()
        )
    }
}
