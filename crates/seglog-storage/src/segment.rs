//! A single log segment: data file, sparse index and optional appender.
//!
//! # Concurrency
//!
//! Every method takes `&self` so a segment can be shared through `Arc`.
//! Mutable state sits behind a mutex; a separate read/write gate orders
//! flushes against structural operations:
//!
//! | Operation            | Gate  |
//! |----------------------|-------|
//! | `flush`              | read  |
//! | `truncate`           | write |
//! | `release_appender`   | write |
//! | `close`              | write |
//!
//! `append` takes no gate and relies on callers not racing it with
//! `truncate` or `release_appender`.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use seglog_config::StorageConfig;
use seglog_io::{DataStream, SegmentAppender, SegmentReader, remove_file};
use seglog_types::{IoPriority, Offset, Term};
use tokio::sync::{Mutex, RwLock};

use crate::StorageError;
use crate::batch::{self, RecordBatch};
use crate::cache::BatchCache;
use crate::index::SegmentIndex;
use crate::observer::{StorageObserver, TracingObserver};
use crate::tracker::OffsetTracker;

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// First offset of the appended batch.
    pub base_offset: Offset,
    /// Last offset of the appended batch.
    pub last_offset: Offset,
    /// Encoded size of the batch in bytes.
    pub byte_size: usize,
}

#[derive(Debug)]
struct SegmentState {
    tracker: OffsetTracker,
    reader: SegmentReader,
    appender: Option<SegmentAppender>,
    index: SegmentIndex,
    cache: Option<BatchCache>,
}

/// An on-disk segment of a log.
///
/// A segment owns a data file read through a [`SegmentReader`], a sparse
/// [`SegmentIndex`] and, while it is the active segment, a
/// [`SegmentAppender`] plus a [`BatchCache`] of recent appends.
///
/// # Invariants
///
/// - `committed_offset <= dirty_offset`
/// - Bytes visible to readers never exceed the bytes flushed
/// - Once closed, file operations fail with [`StorageError::SegmentClosed`]
#[derive(Debug)]
pub struct Segment {
    name: String,
    gate: RwLock<()>,
    state: Mutex<SegmentState>,
    closed: AtomicBool,
    tombstone: AtomicBool,
    observer: Arc<dyn StorageObserver>,
}

impl Segment {
    /// Assembles a segment from already opened parts.
    ///
    /// Events are reported through a [`TracingObserver`] until
    /// [`with_observer`](Self::with_observer) replaces it.
    pub fn new(
        tracker: OffsetTracker,
        reader: SegmentReader,
        index: SegmentIndex,
        appender: Option<SegmentAppender>,
        cache: Option<BatchCache>,
    ) -> Self {
        Self {
            name: reader.filename().display().to_string(),
            gate: RwLock::new(()),
            state: Mutex::new(SegmentState {
                tracker,
                reader,
                appender,
                index,
                cache,
            }),
            closed: AtomicBool::new(false),
            tombstone: AtomicBool::new(false),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replaces the observer notified of lifecycle events.
    pub fn with_observer(mut self, observer: Arc<dyn StorageObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Data file path, as used in error messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` if closing will delete the segment's files.
    pub fn is_tombstone(&self) -> bool {
        self.tombstone.load(Ordering::Acquire)
    }

    /// Marks the segment so that `close` deletes its files.
    pub fn mark_as_tombstone(&self) {
        self.tombstone.store(true, Ordering::Release);
    }

    /// Returns a snapshot of the segment's offsets.
    pub async fn offsets(&self) -> OffsetTracker {
        self.state.lock().await.tracker
    }

    /// Returns `true` while the segment accepts appends.
    pub async fn has_appender(&self) -> bool {
        self.state.lock().await.appender.is_some()
    }

    /// Returns the number of data file bytes visible to readers.
    pub async fn reader_file_size(&self) -> u64 {
        self.state.lock().await.reader.file_size()
    }

    /// Returns a copy of the cached batch containing `offset`.
    pub async fn cache_get(&self, offset: Offset) -> Option<RecordBatch> {
        let state = self.state.lock().await;
        state.cache.as_ref()?.get(offset).cloned()
    }

    /// Writes a batch through the appender and tracks it.
    ///
    /// The batch becomes the dirty tail of the segment; it turns committed
    /// and readable on the next [`flush`](Self::flush). If the write fails
    /// the offsets, index and cache are left as they were.
    ///
    /// # Panics
    ///
    /// Panics if the segment has no appender, or if the bytes written differ
    /// from the batch's declared size.
    pub async fn append(&self, batch: &RecordBatch) -> Result<AppendResult, StorageError> {
        self.ensure_open("append()")?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let appender = state
            .appender
            .as_mut()
            .expect("append requires a segment with an appender");

        let start = appender.file_byte_offset();
        batch::write(appender, batch).await?;
        let end = appender.file_byte_offset();
        let expected = start + batch.size_bytes() as u64;
        assert_eq!(
            end, expected,
            "batch size must be deterministic: wrote {} bytes for a {}-byte batch, {}",
            end - start,
            batch.size_bytes(),
            state.tracker
        );

        state.tracker.dirty_offset = batch.last_offset();
        state.index.maybe_track(batch.header(), start);
        if let Some(cache) = state.cache.as_mut() {
            cache.put(batch);
        }

        Ok(AppendResult {
            base_offset: batch.base_offset(),
            last_offset: batch.last_offset(),
            byte_size: batch.size_bytes(),
        })
    }

    /// Makes appended data durable and visible to readers.
    ///
    /// Advances the committed offset to the dirty offset. Does nothing for a
    /// read-only segment.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let _gate = self.gate.read().await;
        self.ensure_open("flush()")?;
        let mut state = self.state.lock().await;
        Self::flush_appender(&mut state).await
    }

    /// Rolls the segment back so that `prev_last_offset` is its last offset
    /// and `physical` its byte length.
    pub async fn truncate(&self, prev_last_offset: Offset, physical: u64) -> Result<(), StorageError> {
        self.ensure_open("truncate()")?;
        let _gate = self.gate.write().await;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        state.tracker.committed_offset = prev_last_offset;
        state.tracker.dirty_offset = prev_last_offset;
        state.reader.set_file_size(physical);
        if let Some(cache) = state.cache.as_mut() {
            cache.truncate(prev_last_offset.next());
        }
        state.index.truncate(prev_last_offset).await?;
        match state.appender.as_mut() {
            Some(appender) => appender.truncate(physical).await?,
            None => state.reader.truncate(physical).await?,
        }

        self.observer
            .segment_truncated(&self.name, prev_last_offset, physical);
        Ok(())
    }

    /// Loads a persisted index and adopts its max offset.
    ///
    /// # Panics
    ///
    /// Panics if data has already been tracked by this segment.
    pub async fn materialize_index(&self) -> Result<bool, StorageError> {
        self.ensure_open("materialize_index()")?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        assert_eq!(
            state.tracker.base_offset, state.tracker.dirty_offset,
            "index can only be materialized before any data is tracked: {}",
            state.tracker
        );

        if !state.index.materialize_index().await? {
            return Ok(false);
        }
        let max_offset = state.index.max_offset();
        state.tracker.committed_offset = max_offset;
        state.tracker.dirty_offset = max_offset;
        Ok(true)
    }

    /// Flushes and drops the appender and cache, leaving a read-only segment.
    ///
    /// # Panics
    ///
    /// Panics if the segment has no appender.
    pub async fn release_appender(&self) -> Result<(), StorageError> {
        let _gate = self.gate.write().await;
        self.ensure_open("release_appender()")?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        assert!(state.appender.is_some(), "cannot release a null appender");

        Self::flush_appender(state).await?;
        if let Some(appender) = state.appender.as_mut() {
            appender.close().await?;
        }
        state.index.flush().await?;
        state.appender = None;
        state.cache = None;
        Ok(())
    }

    /// Closes reader, appender and index, then removes the files of a
    /// tombstoned segment.
    ///
    /// Unflushed appends are written out first. Failures to remove files
    /// are reported to the observer and do not fail the close.
    pub async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(self.closed_error("close()"));
        }
        let _gate = self.gate.write().await;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        state.reader.close().await?;
        if let Some(appender) = state.appender.as_mut() {
            appender.close().await?;
        }
        state.index.close().await?;

        if self.is_tombstone() {
            self.remove_tombstone_files(state).await;
        }
        self.observer.segment_closed(&self.name);
        Ok(())
    }

    /// Opens a stream starting at the nearest indexed batch at or before
    /// `offset`, or at the start of the file.
    pub async fn offset_data_stream(
        &self,
        offset: Offset,
        priority: IoPriority,
    ) -> Result<DataStream, StorageError> {
        self.ensure_open("offset_data_stream()")?;
        let state = self.state.lock().await;
        let position = state.index.find_nearest(offset).map_or(0, |entry| entry.filepos);
        Ok(state.reader.data_stream(position, priority).await?)
    }

    async fn flush_appender(state: &mut SegmentState) -> Result<(), StorageError> {
        let Some(appender) = state.appender.as_mut() else {
            return Ok(());
        };
        let dirty = state.tracker.dirty_offset;
        let visible = appender.file_byte_offset();
        appender.flush().await?;
        state.tracker.committed_offset = dirty;
        state.reader.set_file_size(visible);
        Ok(())
    }

    async fn remove_tombstone_files(&self, state: &SegmentState) {
        let files = [
            state.reader.filename().to_path_buf(),
            state.index.filename().to_path_buf(),
        ];
        self.observer.removing_tombstone(&files);
        for file in &files {
            if let Err(error) = remove_file(file).await {
                self.observer.tombstone_removal_failed(file, &error);
            }
        }
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(self.closed_error(operation));
        }
        Ok(())
    }

    fn closed_error(&self, operation: &'static str) -> StorageError {
        StorageError::SegmentClosed {
            operation,
            segment: self.name.clone(),
        }
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(state) = self.state.try_lock() else {
            return write!(f, "{{segment:{}, state:<busy>}}", self.name);
        };
        let writer = state
            .appender
            .as_ref()
            .map_or_else(|| "nullptr".to_string(), ToString::to_string);
        let cache = state
            .cache
            .as_ref()
            .map_or_else(|| "nullptr".to_string(), ToString::to_string);
        write!(
            f,
            "{{offset_tracker:{}, reader:{}, writer:{}, cache:{}, closed:{}, tombstone:{}, index:{}}}",
            state.tracker,
            state.reader,
            writer,
            cache,
            self.is_closed(),
            self.is_tombstone(),
            state.index
        )
    }
}

// ============================================================================
// Opening segments from disk
// ============================================================================

/// Data file path for a segment: `{base_offset}-{term}-v1.log`.
pub fn segment_path(dir: &Path, base_offset: Offset, term: Term) -> PathBuf {
    dir.join(format!("{base_offset}-{term}-v1.log"))
}

/// Index file path stored next to a data file.
pub fn index_path(data_path: &Path) -> PathBuf {
    let mut path = data_path.as_os_str().to_owned();
    path.push(".index");
    PathBuf::from(path)
}

/// Opens, or creates when `writable`, the segment stored at `data_path`.
///
/// Writable segments get an appender positioned at the end of the file and,
/// when enabled, a batch cache.
pub async fn open_segment(
    data_path: &Path,
    tracker: OffsetTracker,
    config: &StorageConfig,
    writable: bool,
) -> Result<Segment, StorageError> {
    let appender = if writable {
        Some(SegmentAppender::open(data_path, config.write_behind_bytes).await?)
    } else {
        None
    };
    let reader = SegmentReader::open(data_path)
        .await?
        .with_buffer_size(config.read_buffer_bytes);
    let index = SegmentIndex::new(index_path(data_path), tracker.base_offset, config.index_step_bytes);
    let cache = (writable && config.cache_enabled).then(|| BatchCache::new(config.cache_max_bytes));

    Ok(Segment::new(tracker, reader, index, appender, cache))
}

/// Creates a writable segment for `tracker` under `config.data_dir`,
/// creating the directory if needed.
pub async fn create_segment(
    config: &StorageConfig,
    tracker: OffsetTracker,
) -> Result<Segment, StorageError> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let data_path = segment_path(&config.data_dir, tracker.base_offset, tracker.term);
    open_segment(&data_path, tracker, config, true).await
}
