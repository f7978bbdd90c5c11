//! Per-range write versions with a bounded in-memory table and a durable overflow log.

use bytes::BytesMut;
use chunkvault_common::{
    BackupConfig, ChunkId, RangeKey, Result, Version, VersionRecord, MAX_EPOCH, MAX_VERSION, VERSION_RECORD_SIZE,
};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Durable storage of version records for one range
pub trait VersionLog: Send + Sync {
    fn append(&self, records: &[VersionRecord]) -> Result<()>;

    /// All records in append order
    fn read_all(&self) -> Result<Vec<VersionRecord>>;

    /// Replace the log contents
    fn rewrite(&self, records: &[VersionRecord]) -> Result<()>;
}

fn encode_records(records: &[VersionRecord]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(records.len() * VERSION_RECORD_SIZE);
    for record in records {
        record.encode(&mut buf);
    }
    buf
}

#[derive(Debug, Default)]
pub struct MemoryVersionLog {
    data: Mutex<BytesMut>,
}

impl MemoryVersionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len_bytes(&self) -> usize {
        self.data.lock().len()
    }
}

impl VersionLog for MemoryVersionLog {
    fn append(&self, records: &[VersionRecord]) -> Result<()> {
        self.data.lock().extend_from_slice(&encode_records(records));
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<VersionRecord>> {
        VersionRecord::decode_all(&self.data.lock())
    }

    fn rewrite(&self, records: &[VersionRecord]) -> Result<()> {
        *self.data.lock() = encode_records(records);
        Ok(())
    }
}

/// Version log in a single append-only file
#[derive(Debug, Clone)]
pub struct FileVersionLog {
    path: PathBuf,
}

impl FileVersionLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VersionLog for FileVersionLog {
    fn append(&self, records: &[VersionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&encode_records(records))?;
        file.sync_data()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<VersionRecord>> {
        match fs::read(&self.path) {
            Ok(data) => VersionRecord::decode_all(&data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn rewrite(&self, records: &[VersionRecord]) -> Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encode_records(records))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EpochTag {
    eon: u8,
    epoch: u16,
}

impl EpochTag {
    fn version(self, version: u32) -> Version {
        Version::new(self.eon, self.epoch, version)
    }
}

struct TrackerState {
    hot: HashMap<ChunkId, u32>,
    // Last swapped-out table; its entries carry `retired_tag`
    retired: Arc<HashMap<ChunkId, u32>>,
    retired_tag: EpochTag,
    tag: EpochTag,
    flush_in_flight: bool,
    flush_requested: bool,
}

impl TrackerState {
    /// Returns true if the eon toggled
    fn advance_epoch(&mut self) -> bool {
        if self.tag.epoch == MAX_EPOCH {
            self.tag.epoch = 0;
            self.tag.eon ^= 1;
            true
        } else {
            self.tag.epoch += 1;
            false
        }
    }
}

enum NextStep {
    Done(Version),
    Wait,
    Flush { bump: bool },
}

/// Write versions of the chunks of one backup range.
///
/// Writers only contend on the state lock. Flushes swap the hot table under that lock and append
/// the retired entries to the log after releasing it.
pub struct VersionTracker {
    key: RangeKey,
    flush_threshold: usize,
    wait_threshold: usize,
    state: Mutex<TrackerState>,
    flushed: Condvar,
    log: Arc<dyn VersionLog>,
    // Serializes log access; always taken before `state`
    log_lock: Mutex<()>,
    flusher: Mutex<Option<mpsc::UnboundedSender<RangeKey>>>,
}

impl VersionTracker {
    pub fn new(key: RangeKey, flush_threshold: usize, wait_threshold: usize, log: Arc<dyn VersionLog>) -> Self {
        let flush_threshold = flush_threshold.max(1);
        let start = EpochTag { eon: 0, epoch: 0 };
        Self {
            key,
            flush_threshold,
            wait_threshold: wait_threshold.max(flush_threshold),
            state: Mutex::new(TrackerState {
                hot: HashMap::new(),
                retired: Arc::new(HashMap::new()),
                retired_tag: start,
                tag: start,
                flush_in_flight: false,
                flush_requested: false,
            }),
            flushed: Condvar::new(),
            log,
            log_lock: Mutex::new(()),
            flusher: Mutex::new(None),
        }
    }

    pub fn from_config(key: RangeKey, config: &BackupConfig, log: Arc<dyn VersionLog>) -> Self {
        Self::new(key, config.version_flush_threshold, config.version_wait_threshold, log)
    }

    pub fn key(&self) -> RangeKey {
        self.key
    }

    /// Route flush requests to a background flusher instead of relying on inline flushes
    pub fn attach_flusher(&self, sender: mpsc::UnboundedSender<RangeKey>) {
        *self.flusher.lock() = Some(sender);
    }

    /// Number of chunks in the hot table
    pub fn buffered(&self) -> usize {
        self.state.lock().hot.len()
    }

    /// Buffered version of a chunk, `None` if only the log knows it
    pub fn get(&self, chunk_id: ChunkId) -> Option<Version> {
        let state = self.state.lock();
        if let Some(&version) = state.hot.get(&chunk_id) {
            return Some(state.tag.version(version));
        }
        state
            .retired
            .get(&chunk_id)
            .map(|&version| state.retired_tag.version(version))
    }

    /// Buffered version, falling back to the newest durable record
    pub fn current(&self, chunk_id: ChunkId) -> Result<Option<Version>> {
        if let Some(version) = self.get(chunk_id) {
            return Ok(Some(version));
        }
        let _log = self.log_lock.lock();
        let newest = self
            .log
            .read_all()?
            .into_iter()
            .filter(|r| r.chunk_id == chunk_id)
            .last()
            .map(|r| r.version);
        Ok(newest)
    }

    /// Version for a new write of `chunk_id`. Blocks while the hot table is at its wait threshold.
    pub fn get_next(&self, chunk_id: ChunkId) -> Result<Version> {
        loop {
            let step = {
                let mut state = self.state.lock();
                let step = self.next_step(&mut state, chunk_id);
                if let NextStep::Wait = step {
                    trace!("Writer of {} waits for version flush of range {}", chunk_id, self.key);
                    self.flushed.wait(&mut state);
                    continue;
                }
                step
            };

            match step {
                NextStep::Done(version) => return Ok(version),
                NextStep::Flush { bump } => {
                    self.flush_inner(bump)?;
                }
                NextStep::Wait => continue,
            }
        }
    }

    fn next_step(&self, state: &mut TrackerState, chunk_id: ChunkId) -> NextStep {
        let current = state.hot.get(&chunk_id).copied();

        if current.is_none() && state.hot.len() >= self.wait_threshold {
            return if state.flush_in_flight {
                NextStep::Wait
            } else {
                debug!("Version table of range {} full, flushing inline", self.key);
                NextStep::Flush { bump: false }
            };
        }

        let next = match current {
            Some(version) => version + 1,
            None => match state.retired.get(&chunk_id) {
                // Continue where the retired table left off while it shares the epoch
                Some(&version) if state.retired_tag == state.tag => version + 1,
                _ => 1,
            },
        };

        if next > MAX_VERSION {
            debug!("Version of {} exceeds 24 bits, starting a new epoch", chunk_id);
            return NextStep::Flush { bump: true };
        }

        state.hot.insert(chunk_id, next);
        if state.hot.len() >= self.flush_threshold && !state.flush_requested && !state.flush_in_flight {
            if let Some(sender) = self.flusher.lock().as_ref() {
                if sender.send(self.key).is_ok() {
                    state.flush_requested = true;
                }
            }
        }
        NextStep::Done(state.tag.version(next))
    }

    /// Retire the hot table into the log. Returns true if the eon toggled.
    pub fn flush(&self) -> Result<bool> {
        self.flush_inner(false)
    }

    fn flush_inner(&self, bump: bool) -> Result<bool> {
        let _log = self.log_lock.lock();

        let (retired, tag, wrapped) = {
            let mut state = self.state.lock();
            let hot = std::mem::take(&mut state.hot);
            let mut wrapped = state.advance_epoch();
            let tag = state.tag;
            if bump {
                wrapped |= state.advance_epoch();
            }
            state.retired = Arc::new(hot);
            state.retired_tag = tag;
            state.flush_in_flight = true;
            state.flush_requested = false;
            (Arc::clone(&state.retired), tag, wrapped)
        };

        let records: Vec<VersionRecord> = retired
            .iter()
            .map(|(&chunk_id, &version)| VersionRecord::new(chunk_id, tag.version(version)))
            .collect();
        let result = self.log.append(&records);

        {
            let mut state = self.state.lock();
            if result.is_err() {
                // Keep the unlogged versions buffered for the next flush; newer writes win
                for (&chunk_id, &version) in retired.iter() {
                    state.hot.entry(chunk_id).or_insert(version);
                }
            }
            state.flush_in_flight = false;
        }
        self.flushed.notify_all();

        if let Err(e) = result {
            warn!("Version flush of range {} failed, keeping {} versions buffered: {}", self.key, records.len(), e);
            return Err(e);
        }
        if wrapped {
            info!("Version epoch of range {} wrapped into a new eon", self.key);
        }
        trace!("Flushed {} versions of range {} at epoch {}", records.len(), self.key, tag.epoch);
        Ok(wrapped)
    }

    /// Newest version of every chunk from the log and the in-memory tables. With `write_back`,
    /// the log is rewritten with one record per chunk.
    pub fn read_all(&self, write_back: bool) -> Result<VersionSnapshot> {
        let _log = self.log_lock.lock();

        let mut versions: BTreeMap<ChunkId, Version> = BTreeMap::new();
        for record in self.log.read_all()? {
            versions.insert(record.chunk_id, record.version);
        }

        if write_back {
            let compacted: Vec<VersionRecord> = versions
                .iter()
                .map(|(&chunk_id, &version)| VersionRecord::new(chunk_id, version))
                .collect();
            self.log.rewrite(&compacted)?;
            debug!("Compacted version log of range {} to {} records", self.key, compacted.len());
        }

        let state = self.state.lock();
        for (&chunk_id, &version) in state.retired.iter() {
            versions.insert(chunk_id, state.retired_tag.version(version));
        }
        for (&chunk_id, &version) in state.hot.iter() {
            versions.insert(chunk_id, state.tag.version(version));
        }

        Ok(VersionSnapshot { versions })
    }
}

/// Merged view of all versions of a range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSnapshot {
    pub versions: BTreeMap<ChunkId, Version>,
}

impl VersionSnapshot {
    pub fn lowest_chunk_id(&self) -> Option<ChunkId> {
        self.versions.keys().next().copied()
    }

    pub fn get(&self, chunk_id: ChunkId) -> Option<Version> {
        self.versions.get(&chunk_id).copied()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// One tracker per backup range
pub struct VersionRegistry {
    config: Arc<BackupConfig>,
    trackers: DashMap<RangeKey, Arc<VersionTracker>>,
    flusher: Mutex<Option<mpsc::UnboundedSender<RangeKey>>>,
}

impl VersionRegistry {
    pub fn new(config: Arc<BackupConfig>) -> Self {
        Self {
            config,
            trackers: DashMap::new(),
            flusher: Mutex::new(None),
        }
    }

    /// The tracker of a range, created with a file log when a version directory is configured
    pub fn tracker(&self, key: RangeKey) -> Result<Arc<VersionTracker>> {
        if let Some(tracker) = self.trackers.get(&key) {
            return Ok(Arc::clone(tracker.value()));
        }

        let log: Arc<dyn VersionLog> = match self.config.version_log_path(key.owner, key.range_id) {
            Some(path) => Arc::new(FileVersionLog::open(path)?),
            None => Arc::new(MemoryVersionLog::new()),
        };
        let tracker = VersionTracker::from_config(key, &self.config, log);
        if let Some(sender) = self.flusher.lock().as_ref() {
            tracker.attach_flusher(sender.clone());
        }

        let entry = self.trackers.entry(key).or_insert_with(|| Arc::new(tracker));
        Ok(Arc::clone(entry.value()))
    }

    pub fn get(&self, key: RangeKey) -> Option<Arc<VersionTracker>> {
        self.trackers.get(&key).map(|t| Arc::clone(t.value()))
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Flush every tracker. Returns the number flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let trackers: Vec<Arc<VersionTracker>> = self.trackers.iter().map(|t| Arc::clone(t.value())).collect();
        for tracker in &trackers {
            tracker.flush()?;
        }
        Ok(trackers.len())
    }

    pub fn attach_flusher(&self, sender: mpsc::UnboundedSender<RangeKey>) {
        for tracker in self.trackers.iter() {
            tracker.attach_flusher(sender.clone());
        }
        *self.flusher.lock() = Some(sender);
    }
}

/// Background task serving flush requests of all trackers in a registry
pub struct VersionFlusher;

impl VersionFlusher {
    pub fn spawn(registry: Arc<VersionRegistry>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach_flusher(tx);

        tokio::spawn(async move {
            info!("Version flusher started");
            loop {
                tokio::select! {
                    request = rx.recv() => {
                        let Some(key) = request else { break };
                        let Some(tracker) = registry.get(key) else {
                            warn!("Flush requested for unknown range {}", key);
                            continue;
                        };
                        match tokio::task::spawn_blocking(move || tracker.flush()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => error!("Failed to flush versions of range {}: {}", key, e),
                            Err(e) => error!("Version flush task of range {} panicked: {}", key, e),
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Version flusher shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(flush: usize, wait: usize) -> (VersionTracker, Arc<MemoryVersionLog>) {
        let log = Arc::new(MemoryVersionLog::new());
        (VersionTracker::new(RangeKey::new(1, 0), flush, wait, log.clone()), log)
    }

    /// Memory log whose first append fails
    #[derive(Default)]
    struct FailFirstAppend {
        inner: MemoryVersionLog,
        failed: std::sync::atomic::AtomicBool,
    }

    impl VersionLog for FailFirstAppend {
        fn append(&self, records: &[VersionRecord]) -> Result<()> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(chunkvault_common::ChunkVaultError::Io(std::io::Error::new(
                    ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.append(records)
        }

        fn read_all(&self) -> Result<Vec<VersionRecord>> {
            self.inner.read_all()
        }

        fn rewrite(&self, records: &[VersionRecord]) -> Result<()> {
            self.inner.rewrite(records)
        }
    }

    #[test]
    fn test_failed_append_keeps_versions() {
        let log = Arc::new(FailFirstAppend::default());
        let tracker = VersionTracker::new(RangeKey::new(1, 0), 100, 200, log.clone());
        let a = ChunkId::new(1, 1);
        let b = ChunkId::new(1, 2);

        for _ in 0..3 {
            tracker.get_next(a).unwrap();
        }
        tracker.get_next(b).unwrap();
        assert!(tracker.flush().is_err());

        // Still buffered, never lower than what writers saw
        let buffered = tracker.get(a).unwrap();
        assert_eq!(buffered.version, 3);
        assert!(buffered > Version::new(0, 0, 3));

        // A write after the failure continues from the buffered version
        assert_eq!(tracker.get_next(b).unwrap().version, 2);

        assert!(!tracker.flush().unwrap());
        tracker.flush().unwrap();
        assert_eq!(tracker.current(a).unwrap().unwrap().version, 3);

        let durable = log.read_all().unwrap();
        assert!(durable.iter().any(|r| r.chunk_id == a && r.version.version == 3));
        assert!(durable.iter().any(|r| r.chunk_id == b && r.version.version == 2));
    }

    #[test]
    fn test_versions_continue_after_flush() {
        let (tracker, log) = tracker(100, 200);
        let chunk = ChunkId::new(1, 5);

        assert_eq!(tracker.get(chunk), None);
        assert_eq!(tracker.get_next(chunk).unwrap(), Version::new(0, 0, 1));
        assert!(!tracker.flush().unwrap());
        assert_eq!(log.len_bytes(), VERSION_RECORD_SIZE);

        assert_eq!(tracker.get(chunk), Some(Version::new(0, 1, 1)));
        assert_eq!(tracker.get_next(chunk).unwrap(), Version::new(0, 1, 2));
    }

    #[test]
    fn test_missing_chunk_restarts_in_newer_epoch() {
        let (tracker, _) = tracker(100, 200);
        let chunk = ChunkId::new(1, 5);
        let first = tracker.get_next(chunk).unwrap();
        tracker.flush().unwrap();
        tracker.flush().unwrap();

        let next = tracker.get_next(chunk).unwrap();
        assert_eq!(next.version, 1);
        assert!(next > first);
        assert_eq!(tracker.current(chunk).unwrap(), Some(next));
    }

    #[test]
    fn test_version_overflow_starts_new_epoch() {
        let (tracker, log) = tracker(100, 200);
        let chunk = ChunkId::new(1, 5);
        tracker.state.lock().hot.insert(chunk, MAX_VERSION);
        let before = tracker.get(chunk).unwrap();

        let next = tracker.get_next(chunk).unwrap();
        assert_eq!(next, Version::new(0, 2, 1));
        assert!(next > before);
        // The saturated version reached the log at the intermediate epoch
        assert_eq!(log.read_all().unwrap(), vec![VersionRecord::new(chunk, Version::new(0, 1, MAX_VERSION))]);
    }

    #[test]
    fn test_current_reads_log() {
        let (tracker, _) = tracker(100, 200);
        let chunk = ChunkId::new(1, 5);
        tracker.get_next(chunk).unwrap();
        tracker.flush().unwrap();
        tracker.flush().unwrap();
        assert_eq!(tracker.get(chunk), None);
        assert_eq!(tracker.current(chunk).unwrap(), Some(Version::new(0, 1, 1)));
    }

    #[test]
    fn test_inline_flush_at_wait_threshold() {
        let (tracker, log) = tracker(2, 2);
        tracker.get_next(ChunkId::new(1, 0)).unwrap();
        tracker.get_next(ChunkId::new(1, 1)).unwrap();
        let version = tracker.get_next(ChunkId::new(1, 2)).unwrap();
        assert_eq!(version, Version::new(0, 1, 1));
        assert_eq!(tracker.buffered(), 1);
        assert_eq!(log.len_bytes(), 2 * VERSION_RECORD_SIZE);
    }

    #[test]
    fn test_flush_request_sent_once() {
        let (tracker, _) = tracker(2, 10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        tracker.attach_flusher(tx);

        for local in 0..5 {
            tracker.get_next(ChunkId::new(1, local)).unwrap();
        }
        assert_eq!(rx.try_recv().unwrap(), RangeKey::new(1, 0));
        assert!(rx.try_recv().is_err());

        tracker.flush().unwrap();
        tracker.get_next(ChunkId::new(1, 10)).unwrap();
        tracker.get_next(ChunkId::new(1, 11)).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_memory_log_corruption_detected() {
        let log = MemoryVersionLog::new();
        log.data.lock().extend_from_slice(&[0u8; 5]);
        assert!(log.read_all().is_err());
    }

    #[test]
    fn test_registry_uses_memory_log_without_dir() {
        let registry = VersionRegistry::new(Arc::new(BackupConfig::default()));
        let a = registry.tracker(RangeKey::new(1, 0)).unwrap();
        let b = registry.tracker(RangeKey::new(1, 0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.get_next(ChunkId::new(1, 0)).unwrap();
        assert_eq!(registry.flush_all().unwrap(), 1);
        assert_eq!(a.buffered(), 0);
    }
}
