mod common;

use chunkvault_backup::{FileVersionLog, MemoryVersionLog, VersionFlusher, VersionLog, VersionRegistry, VersionTracker};
use chunkvault_common::{BackupConfig, ChunkId, RangeKey, Version, MAX_EPOCH, VERSION_RECORD_SIZE};
use common::wait_for;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tokio::sync::broadcast;

fn memory_tracker(flush: usize, wait: usize) -> VersionTracker {
    VersionTracker::new(RangeKey::new(1, 0), flush, wait, Arc::new(MemoryVersionLog::new()))
}

#[test]
fn test_versions_survive_flush_with_next_epoch() {
    let tracker = memory_tracker(1000, 2000);
    let chunk = ChunkId::new(1, 42);

    let versions: Vec<Version> = (0..3).map(|_| tracker.get_next(chunk).unwrap()).collect();
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(versions.iter().all(|v| v.epoch == versions[0].epoch && v.eon == versions[0].eon));

    assert!(!tracker.flush().unwrap());
    let after = tracker.get(chunk).unwrap();
    assert_eq!(after.version, 3);
    assert_eq!(after.epoch, versions[0].epoch + 1);
    assert_eq!(after.eon, versions[0].eon);
}

#[test]
fn test_epoch_wrap_toggles_eon() {
    let tracker = memory_tracker(1000, 2000);
    let chunk = ChunkId::new(1, 1);
    let mut last = tracker.get_next(chunk).unwrap();

    for _ in 0..MAX_EPOCH {
        assert!(!tracker.flush().unwrap());
    }
    let before_wrap = tracker.get_next(chunk).unwrap();
    assert_eq!(before_wrap.epoch, MAX_EPOCH);
    assert!(before_wrap > last);
    last = before_wrap;

    assert!(tracker.flush().unwrap());
    let wrapped = tracker.get_next(chunk).unwrap();
    assert_eq!(wrapped.eon, 1);
    assert_eq!(wrapped.epoch, 0);
    assert!(wrapped > last);
}

#[test]
fn test_read_all_compacts_file_log() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(FileVersionLog::open(dir.path().join("versions.log")).unwrap());
    let tracker = VersionTracker::new(RangeKey::new(1, 0), 1000, 2000, log.clone());

    for round in 0..4 {
        for local in 10..20 {
            tracker.get_next(ChunkId::new(1, local)).unwrap();
        }
        if round < 3 {
            tracker.flush().unwrap();
        }
    }
    // Hot-only chunk
    tracker.get_next(ChunkId::new(1, 5)).unwrap();
    assert_eq!(log.read_all().unwrap().len(), 30);

    let snapshot = tracker.read_all(true).unwrap();
    assert_eq!(snapshot.len(), 11);
    assert_eq!(snapshot.lowest_chunk_id(), Some(ChunkId::new(1, 5)));
    for local in 10..20 {
        let version = snapshot.get(ChunkId::new(1, local)).unwrap();
        assert_eq!(version.version, 4);
        assert_eq!(version.epoch, 3);
    }

    // Durable log keeps one record per flushed chunk
    let compacted = log.read_all().unwrap();
    assert_eq!(compacted.len(), 10);
    assert!(compacted.iter().all(|r| r.version.version == 3));
    let bytes = std::fs::metadata(log.path()).unwrap().len();
    assert_eq!(bytes as usize, 10 * VERSION_RECORD_SIZE);

    // A reopened log sees the same records
    let reopened = FileVersionLog::open(log.path()).unwrap();
    assert_eq!(reopened.read_all().unwrap(), compacted);
}

#[test]
fn test_writers_block_at_wait_threshold() {
    let tracker = Arc::new(memory_tracker(16, 32));
    let handles: Vec<_> = (0..8u64)
        .map(|writer| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let mut seen: HashMap<ChunkId, Version> = HashMap::new();
                for round in 0..200u64 {
                    let chunk = ChunkId::new(1, writer * 1000 + round % 50);
                    let version = tracker.get_next(chunk).unwrap();
                    if let Some(previous) = seen.insert(chunk, version) {
                        assert!(version > previous, "{} went from {} to {}", chunk, previous, version);
                    }
                    assert!(tracker.buffered() <= 32);
                }
                seen
            })
        })
        .collect();

    let mut expected = HashMap::new();
    for handle in handles {
        expected.extend(handle.join().unwrap());
    }

    let snapshot = tracker.read_all(false).unwrap();
    assert_eq!(snapshot.len(), 400);
    for (chunk, version) in expected {
        assert_eq!(snapshot.get(chunk), Some(version));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flusher_drains_trackers() {
    let config = BackupConfig {
        version_flush_threshold: 8,
        version_wait_threshold: 1000,
        ..BackupConfig::default()
    };
    let registry = Arc::new(VersionRegistry::new(Arc::new(config)));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let flusher = VersionFlusher::spawn(Arc::clone(&registry), shutdown_rx);

    let key = RangeKey::new(1, 0);
    let tracker = registry.tracker(key).unwrap();
    for local in 0..8 {
        tracker.get_next(ChunkId::new(1, local)).unwrap();
    }

    wait_for(|| tracker.buffered() == 0).await;
    assert_eq!(tracker.get(ChunkId::new(1, 3)).unwrap().epoch, 1);

    shutdown_tx.send(()).unwrap();
    flusher.await.unwrap();
}
