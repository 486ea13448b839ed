//! Segment lifecycle and end-to-end compaction tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use proptest::prelude::*;
use seglog_config::{CompactionConfig, StorageConfig};
use seglog_io::IoError;
use seglog_types::{CompressionKind, IoPriority, Offset, Term};

use crate::batch::{BatchReader, RecordBatch, RecordBatchBuilder, RecordBatchHeader, Records};
use crate::compaction::{CompactedIndexWriter, compact_segment};
use crate::observer::{NoopObserver, StorageObserver};
use crate::segment::{Segment, create_segment, index_path, open_segment, segment_path};
use crate::StorageError;
use crate::tracker::OffsetTracker;

// ============================================================================
// Helpers
// ============================================================================

fn config() -> StorageConfig {
    StorageConfig {
        index_step_bytes: 1,
        ..StorageConfig::default()
    }
}

fn batch(base: i64, keys: &[&str]) -> RecordBatch {
    let mut builder = RecordBatchBuilder::new(Offset::new(base));
    for (i, key) in keys.iter().enumerate() {
        builder = builder.add_record(key.to_string(), format!("{key}-{}", base + i as i64));
    }
    builder.build().unwrap()
}

async fn writable(dir: &Path, base: i64) -> Segment {
    let path = segment_path(dir, Offset::new(base), Term::new(1));
    open_segment(&path, OffsetTracker::new(Term::new(1), Offset::new(base)), &config(), true)
        .await
        .unwrap()
        .with_observer(Arc::new(NoopObserver))
}

async fn read_batches(segment: &Segment, from: Offset) -> Vec<RecordBatch> {
    let stream = segment
        .offset_data_stream(from, IoPriority::FOREGROUND)
        .await
        .unwrap();
    let mut reader = BatchReader::new(stream);
    let mut batches = Vec::new();
    while let Some(batch) = reader.next_batch().await.unwrap() {
        batches.push(batch);
    }
    batches
}

fn keys_of(batch: &RecordBatch) -> Vec<String> {
    let Records::Uncompressed(records) = batch.records() else {
        panic!("expected uncompressed batch");
    };
    records
        .iter()
        .map(|r| String::from_utf8(r.key.as_ref().unwrap().to_vec()).unwrap())
        .collect()
}

/// Observer that records event names for assertions.
#[derive(Debug, Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl StorageObserver for RecordingObserver {
    fn segment_closed(&self, _segment: &str) {
        self.push("closed".to_string());
    }

    fn removing_tombstone(&self, files: &[PathBuf]) {
        self.push(format!("removing:{}", files.len()));
    }

    fn tombstone_removal_failed(&self, file: &Path, _error: &IoError) {
        let name = file.file_name().unwrap().to_string_lossy().to_string();
        self.push(format!("removal_failed:{name}"));
    }

    fn compressed_batch_skipped(&self, header: &RecordBatchHeader) {
        self.push(format!("compressed:{}", header.base_offset));
    }
}

// ============================================================================
// Append & flush
// ============================================================================

#[tokio::test]
async fn append_then_flush_commits_last_offset() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 100).await;
    let b = batch(100, &["a", "b", "c"]);

    let result = segment.append(&b).await.unwrap();
    assert_eq!(result.base_offset, Offset::new(100));
    assert_eq!(result.last_offset, Offset::new(102));
    assert_eq!(result.byte_size, b.size_bytes());

    let offsets = segment.offsets().await;
    assert_eq!(offsets.dirty_offset, Offset::new(102));
    assert_eq!(offsets.committed_offset, Offset::new(100));
    assert_eq!(segment.reader_file_size().await, 0);

    segment.flush().await.unwrap();
    let offsets = segment.offsets().await;
    assert_eq!(offsets.committed_offset, Offset::new(102));
    assert_eq!(segment.reader_file_size().await, b.size_bytes() as u64);
}

#[tokio::test]
async fn flush_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    segment.append(&batch(0, &["a", "b"])).await.unwrap();

    segment.flush().await.unwrap();
    let first = (segment.offsets().await, segment.reader_file_size().await);
    segment.flush().await.unwrap();
    let second = (segment.offsets().await, segment.reader_file_size().await);

    assert_eq!(first, second);
}

#[tokio::test]
async fn appended_batches_are_cached_and_readable() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    let first = batch(0, &["a", "b"]);
    let second = batch(2, &["c"]);
    segment.append(&first).await.unwrap();
    segment.append(&second).await.unwrap();
    segment.flush().await.unwrap();

    assert_eq!(segment.cache_get(Offset::new(1)).await, Some(first.clone()));
    assert_eq!(read_batches(&segment, Offset::ZERO).await, vec![first, second.clone()]);

    // With an entry per batch, the stream starts at the batch holding the offset.
    assert_eq!(read_batches(&segment, Offset::new(2)).await, vec![second]);
}

#[tokio::test]
#[should_panic(expected = "append requires a segment with an appender")]
async fn append_without_appender_panics() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    segment.release_appender().await.unwrap();
    let _ = segment.append(&batch(0, &["a"])).await;
}

#[tokio::test]
async fn shared_segment_serves_concurrent_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let segment = Arc::new(writable(dir.path(), 0).await);

    for base in 0..8 {
        segment.append(&batch(base, &["k"])).await.unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let segment = Arc::clone(&segment);
                tokio::spawn(async move { segment.flush().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    let offsets = segment.offsets().await;
    assert_eq!(offsets.committed_offset, Offset::new(7));
    assert_eq!(read_batches(&segment, Offset::ZERO).await.len(), 8);
}

// ============================================================================
// Truncate
// ============================================================================

#[tokio::test]
async fn truncate_then_append_overwrites_tail() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    let first = batch(0, &["a", "b"]);
    segment.append(&first).await.unwrap();
    segment.append(&batch(2, &["c", "d"])).await.unwrap();
    segment.flush().await.unwrap();

    segment
        .truncate(first.last_offset(), first.size_bytes() as u64)
        .await
        .unwrap();

    let offsets = segment.offsets().await;
    assert_eq!(offsets.dirty_offset, Offset::new(1));
    assert_eq!(offsets.committed_offset, Offset::new(1));
    assert_eq!(segment.reader_file_size().await, first.size_bytes() as u64);
    assert!(segment.cache_get(Offset::new(2)).await.is_none());
    assert!(segment.cache_get(Offset::new(1)).await.is_some());

    let replacement = batch(2, &["x"]);
    segment.append(&replacement).await.unwrap();
    segment.flush().await.unwrap();

    assert_eq!(
        read_batches(&segment, Offset::ZERO).await,
        vec![first, replacement]
    );
    assert_eq!(segment.offsets().await.committed_offset, Offset::new(2));
}

#[tokio::test]
async fn truncate_read_only_segment_shortens_file() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    let first = batch(0, &["a"]);
    segment.append(&first).await.unwrap();
    segment.append(&batch(1, &["b"])).await.unwrap();
    segment.release_appender().await.unwrap();

    segment.truncate(Offset::ZERO, first.size_bytes() as u64).await.unwrap();

    let path = segment_path(dir.path(), Offset::ZERO, Term::new(1));
    let on_disk = tokio::fs::metadata(&path).await.unwrap().len();
    assert_eq!(on_disk, first.size_bytes() as u64);
    assert_eq!(read_batches(&segment, Offset::ZERO).await, vec![first]);
}

// ============================================================================
// Release, materialize, close
// ============================================================================

#[tokio::test]
async fn release_appender_leaves_readable_segment() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    let b = batch(0, &["a", "b"]);
    segment.append(&b).await.unwrap();

    segment.release_appender().await.unwrap();

    assert!(!segment.has_appender().await);
    assert!(segment.cache_get(Offset::ZERO).await.is_none());
    assert_eq!(segment.offsets().await.committed_offset, Offset::new(1));
    assert_eq!(read_batches(&segment, Offset::ZERO).await, vec![b]);

    // Flushing a read-only segment is a no-op.
    segment.flush().await.unwrap();
}

#[tokio::test]
#[should_panic(expected = "cannot release a null appender")]
async fn releasing_twice_panics() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    segment.release_appender().await.unwrap();
    let _ = segment.release_appender().await;
}

#[tokio::test]
async fn materialize_adopts_persisted_index() {
    let dir = tempfile::tempdir().unwrap();
    let written = writable(dir.path(), 10).await;
    written.append(&batch(10, &["a", "b"])).await.unwrap();
    written.append(&batch(12, &["c", "d", "e"])).await.unwrap();
    written.release_appender().await.unwrap();
    written.close().await.unwrap();

    let path = segment_path(dir.path(), Offset::new(10), Term::new(1));
    let reopened = open_segment(&path, OffsetTracker::new(Term::new(1), Offset::new(10)), &config(), false)
        .await
        .unwrap();

    assert!(reopened.materialize_index().await.unwrap());
    let offsets = reopened.offsets().await;
    assert_eq!(offsets.committed_offset, Offset::new(14));
    assert_eq!(offsets.dirty_offset, Offset::new(14));
    assert_eq!(read_batches(&reopened, Offset::new(13)).await.len(), 1);
}

#[tokio::test]
async fn materialize_without_index_file_reports_false() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;

    assert!(!segment.materialize_index().await.unwrap());
    assert_eq!(segment.offsets().await, OffsetTracker::new(Term::new(1), Offset::ZERO));
}

#[tokio::test]
#[should_panic(expected = "index can only be materialized before any data is tracked")]
async fn materialize_after_append_panics() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    segment.append(&batch(0, &["a", "b"])).await.unwrap();
    let _ = segment.materialize_index().await;
}

#[tokio::test]
async fn operations_after_close_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    segment.append(&batch(0, &["a"])).await.unwrap();
    segment.close().await.unwrap();
    assert!(segment.is_closed());

    let append = segment.append(&batch(1, &["b"])).await;
    assert!(matches!(
        append,
        Err(StorageError::SegmentClosed { operation: "append()", .. })
    ));
    assert!(matches!(
        segment.flush().await,
        Err(StorageError::SegmentClosed { operation: "flush()", .. })
    ));
    assert!(matches!(
        segment.truncate(Offset::ZERO, 0).await,
        Err(StorageError::SegmentClosed { .. })
    ));
    assert!(matches!(
        segment.offset_data_stream(Offset::ZERO, IoPriority::FOREGROUND).await,
        Err(StorageError::SegmentClosed { .. })
    ));
    assert!(matches!(
        segment.close().await,
        Err(StorageError::SegmentClosed { operation: "close()", .. })
    ));
}

#[tokio::test]
async fn close_persists_unflushed_appends() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    let b = batch(0, &["a", "b"]);
    segment.append(&b).await.unwrap();
    segment.close().await.unwrap();

    let path = segment_path(dir.path(), Offset::ZERO, Term::new(1));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b.encode().to_vec());
    assert!(tokio::fs::try_exists(index_path(&path)).await.unwrap());
}

#[tokio::test]
async fn tombstone_close_removes_files() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(RecordingObserver::default());
    let segment = writable(dir.path(), 0).await.with_observer(observer.clone());
    segment.append(&batch(0, &["a"])).await.unwrap();
    segment.mark_as_tombstone();
    assert!(segment.is_tombstone());

    segment.close().await.unwrap();

    let path = segment_path(dir.path(), Offset::ZERO, Term::new(1));
    assert!(!tokio::fs::try_exists(&path).await.unwrap());
    assert!(!tokio::fs::try_exists(index_path(&path)).await.unwrap());
    assert_eq!(observer.events(), vec!["removing:2", "closed"]);
}

#[tokio::test]
async fn tombstone_removal_failures_are_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(RecordingObserver::default());
    // Nothing appended, so no index file is ever written.
    let segment = writable(dir.path(), 0).await.with_observer(observer.clone());
    segment.mark_as_tombstone();

    segment.close().await.unwrap();

    let events = observer.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], "removing:2");
    assert!(events[1].starts_with("removal_failed:") && events[1].ends_with(".index"));
    assert_eq!(events[2], "closed");
}

#[tokio::test]
async fn display_describes_segment_parts() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    let description = segment.to_string();

    assert!(description.contains("offset_tracker:{term:1"));
    assert!(description.contains("closed:false"));
    assert!(description.contains("tombstone:false"));

    segment.release_appender().await.unwrap();
    assert!(segment.to_string().contains("writer:nullptr"));
}

// ============================================================================
// Compaction end to end
// ============================================================================

async fn append_indexed(segment: &Segment, writer: &mut CompactedIndexWriter, b: &RecordBatch) {
    segment.append(b).await.unwrap();
    writer.index_batch(b).await.unwrap();
}

#[tokio::test]
async fn compaction_keeps_latest_live_record_per_key() {
    let dir = tempfile::tempdir().unwrap();
    let source = writable(dir.path(), 0).await;
    let source_index = dir.path().join("0-1-v1.log.compaction_index");
    let mut writer = CompactedIndexWriter::create(&source_index).await.unwrap();

    let b0 = batch(0, &["a", "d", "a"]);
    let b1 = batch(3, &["c", "b"]);
    let b2 = batch(5, &["a"]);
    for b in [&b0, &b1, &b2] {
        append_indexed(&source, &mut writer, b).await;
    }
    source.flush().await.unwrap();
    let physical = source.reader_file_size().await;

    // An append that is later rolled back must not win for its key.
    append_indexed(&source, &mut writer, &batch(6, &["a"])).await;
    source.flush().await.unwrap();
    source.truncate(Offset::new(5), physical).await.unwrap();
    writer.truncate(Offset::new(6)).await.unwrap();
    writer.close().await.unwrap();

    let out = dir.path().join("compacted");
    tokio::fs::create_dir(&out).await.unwrap();
    let target = writable(&out, 0).await;
    let target_index = out.join("0-1-v1.log.compaction_index");
    let config = CompactionConfig {
        eviction_seed: Some(7),
        ..CompactionConfig::default()
    };

    let stats = compact_segment(
        &source,
        &source_index,
        &target,
        &target_index,
        &config,
        Arc::new(NoopObserver),
    )
    .await
    .unwrap();

    assert_eq!(stats.entries_scanned, 8);
    assert_eq!(stats.entries_retained, 4);
    assert_eq!(stats.copy.batches_rewritten, 1);
    assert_eq!(stats.copy.batches_kept, 2);
    assert_eq!(stats.copy.batches_dropped, 0);
    assert_eq!(stats.copy.records_written, 4);

    let batches = read_batches(&target, Offset::ZERO).await;
    assert_eq!(batches.len(), 3);
    assert_eq!(keys_of(&batches[0]), vec!["d"]);
    assert_eq!(batches[0].base_offset(), Offset::ZERO);
    assert_eq!(batches[0].last_offset(), Offset::new(2));
    assert_eq!(batches[1], b1);
    assert_eq!(batches[2], b2);
    assert_eq!(target.offsets().await.committed_offset, Offset::new(5));
}

#[tokio::test]
async fn compaction_skips_compressed_batches() {
    let dir = tempfile::tempdir().unwrap();
    let source = writable(dir.path(), 0).await;
    let source_index = dir.path().join("source.compaction_index");
    let mut writer = CompactedIndexWriter::create(&source_index).await.unwrap();

    let compressed = RecordBatchBuilder::new(Offset::ZERO)
        .with_compression(CompressionKind::Lz4)
        .add_record("a", "1")
        .build()
        .unwrap();
    append_indexed(&source, &mut writer, &compressed).await;
    append_indexed(&source, &mut writer, &batch(1, &["b"])).await;
    source.flush().await.unwrap();
    writer.close().await.unwrap();

    let out = dir.path().join("compacted");
    tokio::fs::create_dir(&out).await.unwrap();
    let target = writable(&out, 0).await;
    let observer = Arc::new(RecordingObserver::default());

    let stats = compact_segment(
        &source,
        &source_index,
        &target,
        &out.join("target.compaction_index"),
        &CompactionConfig::default(),
        observer.clone(),
    )
    .await
    .unwrap();

    assert_eq!(stats.copy.compressed_skipped, 1);
    assert_eq!(observer.events(), vec!["compressed:0"]);
    let batches = read_batches(&target, Offset::ZERO).await;
    assert_eq!(batches.len(), 1);
    assert_eq!(keys_of(&batches[0]), vec!["b"]);
}

#[tokio::test]
async fn compaction_under_tight_budget_never_loses_latest_values() {
    let dir = tempfile::tempdir().unwrap();
    let source = writable(dir.path(), 0).await;
    let source_index = dir.path().join("source.compaction_index");
    let mut writer = CompactedIndexWriter::create(&source_index).await.unwrap();

    let keys = ["k1", "k2", "k3", "k1", "k4", "k2", "k5", "k1"];
    for (i, key) in keys.iter().enumerate() {
        append_indexed(&source, &mut writer, &batch(i as i64, &[key])).await;
    }
    source.flush().await.unwrap();
    writer.close().await.unwrap();

    let out = dir.path().join("compacted");
    tokio::fs::create_dir(&out).await.unwrap();
    let target = writable(&out, 0).await;
    let config = CompactionConfig {
        key_map_max_memory_bytes: 4,
        eviction_seed: Some(42),
    };

    compact_segment(
        &source,
        &source_index,
        &target,
        &out.join("target.compaction_index"),
        &config,
        Arc::new(NoopObserver),
    )
    .await
    .unwrap();

    let surviving: Vec<(String, Offset)> = read_batches(&target, Offset::ZERO)
        .await
        .iter()
        .map(|b| (keys_of(b)[0].clone(), b.base_offset()))
        .collect();
    for (key, latest) in [("k1", 7), ("k2", 5), ("k3", 2), ("k4", 4), ("k5", 6)] {
        assert!(
            surviving.contains(&(key.to_string(), Offset::new(latest))),
            "latest {key} at {latest} must survive: {surviving:?}"
        );
    }
}

// ============================================================================
// Property tests
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Append(u8),
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![(1u8..4).prop_map(Op::Append), Just(Op::Flush)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn tracker_offsets_stay_ordered(ops in prop::collection::vec(op(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let segment = writable(dir.path(), 50).await;
            let mut next = 50i64;
            for op in &ops {
                match op {
                    Op::Append(records) => {
                        let keys: Vec<String> = (0..*records).map(|i| format!("k{i}")).collect();
                        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                        segment.append(&batch(next, &refs)).await.unwrap();
                        next += i64::from(*records);
                    }
                    Op::Flush => segment.flush().await.unwrap(),
                }
                let t = segment.offsets().await;
                assert!(t.base_offset <= t.committed_offset);
                assert!(t.committed_offset <= t.dirty_offset);
            }

            segment.flush().await.unwrap();
            let t = segment.offsets().await;
            assert_eq!(t.committed_offset, t.dirty_offset);
            let total: usize = read_batches(&segment, Offset::new(50))
                .await
                .iter()
                .map(RecordBatch::record_count)
                .sum();
            assert_eq!(total as i64, next - 50);
        });
    }
}

#[tokio::test]
async fn binary_keys_round_trip_through_segment() {
    let dir = tempfile::tempdir().unwrap();
    let segment = writable(dir.path(), 0).await;
    let b = RecordBatchBuilder::new(Offset::ZERO)
        .add_record(Bytes::from_static(&[0xff, 0x00]), Bytes::new())
        .add_record_at(3, None, None)
        .build()
        .unwrap();
    segment.append(&b).await.unwrap();
    segment.flush().await.unwrap();

    let read = read_batches(&segment, Offset::ZERO).await;
    let Records::Uncompressed(records) = read[0].records() else {
        panic!("expected uncompressed batch");
    };
    assert_eq!(records[0].key.as_deref(), Some(&[0xff, 0x00][..]));
    assert_eq!(records[0].value.as_deref(), Some(&[][..]));
    assert_eq!(records[1].key, None);
    assert_eq!(records[1].timestamp_delta, 3);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn failed_append_leaves_segment_untouched() {
    let config = StorageConfig {
        write_behind_bytes: 1,
        ..config()
    };
    let segment = open_segment(
        Path::new("/dev/full"),
        OffsetTracker::new(Term::new(1), Offset::ZERO),
        &config,
        true,
    )
    .await
    .unwrap();

    let mut failed = None;
    for base in (0..16).step_by(2) {
        let before = segment.offsets().await;
        let b = batch(base, &["k", "v"]);
        if let Err(e) = segment.append(&b).await {
            failed = Some((before, b, e));
            break;
        }
    }

    let (before, b, err) = failed.expect("writes to /dev/full must fail");
    assert!(matches!(err, StorageError::Io(IoError::Io { .. })));
    assert_eq!(segment.offsets().await, before);
    assert!(segment.cache_get(b.base_offset()).await.is_none());

    let retry = segment.append(&b).await;
    assert!(matches!(retry, Err(StorageError::Io(IoError::Poisoned { .. }))));
    assert_eq!(segment.offsets().await, before);
}

#[tokio::test]
async fn create_segment_places_files_under_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        data_dir: dir.path().join("nested").join("data"),
        ..config()
    };
    let segment = create_segment(&config, OffsetTracker::new(Term::new(3), Offset::new(40)))
        .await
        .unwrap();

    segment.append(&batch(40, &["a", "b"])).await.unwrap();
    segment.flush().await.unwrap();
    segment.close().await.unwrap();

    let data = segment_path(&config.data_dir, Offset::new(40), Term::new(3));
    assert!(tokio::fs::try_exists(&data).await.unwrap());
    assert!(tokio::fs::try_exists(index_path(&data)).await.unwrap());
}
