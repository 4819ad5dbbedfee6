// ----------------------------------------------------------------------------
// Append-Only Log Sample Store
// ----------------------------------------------------------------------------
// Durable sample storage: every insert and purge is appended to a single log
// file as a length-prefixed, CRC-checked bincode record and applied to an
// in-memory index. On open the log is replayed; a torn or corrupt tail (a
// crash mid-append) is truncated back to the last intact record.
//
// Record layout (little endian):
//   [len: u32][crc32c(payload): u32][payload: len bytes]
// ----------------------------------------------------------------------------

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::memory::MemorySampleStore;
use super::{SampleFilter, SampleStore};
use crate::error::{MetricsError, MetricsResult};
use crate::logging::targets;
use crate::time::Timestamp;
use crate::types::{MetricSample, SampleId, SampleTable, SignalType};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const RECORD_HEADER_LEN: usize = 8;
const MAX_RECORD_LEN: usize = 4 * 1024 * 1024;

/// One log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogEntry {
    Insert(MetricSample),
    Purge { table: SampleTable, cutoff: Timestamp },
}

fn encode_record(entry: &LogEntry) -> MetricsResult<Vec<u8>> {
    let payload = bincode::serialize(entry).map_err(|e| MetricsError::Internal(format!("log encode: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_RECORD_LEN)
        .ok_or_else(|| MetricsError::validation("sample", "record too large for the sample log"))?;

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&CASTAGNOLI.checksum(&payload).to_le_bytes());
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Decode consecutive records; returns the entries and the length of the
/// intact prefix.
fn decode_records(bytes: &[u8]) -> (Vec<LogEntry>, usize) {
    let mut entries = Vec::new();
    let mut offset = 0;

    while bytes.len() - offset >= RECORD_HEADER_LEN {
        let header = &bytes[offset..offset + RECORD_HEADER_LEN];
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let start = offset + RECORD_HEADER_LEN;
        if len > MAX_RECORD_LEN || bytes.len() - start < len {
            break;
        }
        let payload = &bytes[start..start + len];
        if CASTAGNOLI.checksum(payload) != crc {
            break;
        }
        match bincode::deserialize::<LogEntry>(payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        offset = start + len;
    }

    (entries, offset)
}

/// What happened while replaying the log on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub records: usize,
    pub live_samples: usize,
    pub truncated_bytes: u64,
}

#[derive(Debug, Default)]
struct LogStats {
    records_appended: AtomicU64,
    bytes_appended: AtomicU64,
}

/// Write `live` to `tmp_path`, sync it and move it over `path`. The returned
/// handle is positioned at the end of the new log.
fn write_compacted(tmp_path: &Path, path: &Path, live: &[MetricSample]) -> MetricsResult<File> {
    let file = OpenOptions::new().write(true).create(true).truncate(true).open(tmp_path)?;
    let mut tmp = BufWriter::new(file);
    for sample in live {
        tmp.write_all(&encode_record(&LogEntry::Insert(sample.clone()))?)?;
    }
    let file = tmp.into_inner().map_err(|e| MetricsError::Io(e.into_error()))?;
    file.sync_all()?;
    fs::rename(tmp_path, path)?;
    Ok(file)
}

/// State shared with the blocking tasks that touch the file.
#[derive(Debug)]
struct LogShared {
    path: PathBuf,
    index: MemorySampleStore,
    writer: Mutex<BufWriter<File>>,
    sync_every_write: bool,
    stats: LogStats,
}

impl LogShared {
    fn append(&self, writer: &mut BufWriter<File>, entry: &LogEntry, operation: &str) -> MetricsResult<()> {
        let record = encode_record(entry)?;
        let unavailable = |e: std::io::Error| MetricsError::store_unavailable(operation, e.to_string());

        writer.write_all(&record).map_err(unavailable)?;
        writer.flush().map_err(unavailable)?;
        if self.sync_every_write {
            writer.get_ref().sync_data().map_err(unavailable)?;
        }

        self.stats.records_appended.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.bytes_appended.fetch_add(record.len() as u64, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn insert(&self, sample: MetricSample) -> MetricsResult<()> {
        let mut writer = self.writer.lock();
        if self.index.contains(sample.sample_id) {
            return Err(MetricsError::validation(
                "sampleId",
                format!("sample {} already exists", sample.sample_id),
            ));
        }
        self.append(&mut writer, &LogEntry::Insert(sample.clone()), "insert")?;
        self.index.insert_sample(sample)
    }

    fn purge(&self, table: SampleTable, cutoff: Timestamp) -> MetricsResult<usize> {
        let mut writer = self.writer.lock();
        self.append(&mut writer, &LogEntry::Purge { table, cutoff }, "purge")?;
        Ok(self.index.purge_samples(table, cutoff))
    }

    fn sync(&self) -> MetricsResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// The compacted file is written through the handle that then becomes
    /// the writer, so no reopen happens after the rename. Any failure leaves
    /// the current log and writer untouched.
    fn compact(&self) -> MetricsResult<usize> {
        let mut writer = self.writer.lock();
        let live = self.index.scan_samples(&SampleFilter::new());

        let tmp_path = self.path.with_extension("compact");
        let rewritten = write_compacted(&tmp_path, &self.path, &live);

        let file = match rewritten {
            Ok(file) => file,
            Err(e) => {
                warn!(target: targets::STORE, path = %self.path.display(), error = %e, "Sample log compaction failed");
                if tmp_path.is_file() {
                    let _ = fs::remove_file(&tmp_path);
                }
                return Err(e);
            }
        };
        *writer = BufWriter::new(file);

        info!(target: targets::STORE, path = %self.path.display(), live_samples = live.len(), "Sample log compacted");
        Ok(live.len())
    }
}

/// Durable sample store backed by an append-only log file. File I/O runs on
/// the blocking pool so callers can bound it with a timeout.
#[derive(Debug)]
pub struct LogSampleStore {
    shared: Arc<LogShared>,
    replay: ReplayReport,
}

impl LogSampleStore {
    /// Open (or create) the log at `path` and replay it.
    pub fn open(path: impl AsRef<Path>, sync_every_write: bool) -> MetricsResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().read(true).append(true).create(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (entries, intact) = decode_records(&bytes);
        let truncated_bytes = (bytes.len() - intact) as u64;
        if truncated_bytes > 0 {
            warn!(
                target: targets::STORE,
                path = %path.display(),
                truncated_bytes,
                "Truncating torn tail of sample log"
            );
            file.set_len(intact as u64)?;
        }

        let index = MemorySampleStore::new();
        let records = entries.len();
        for entry in entries {
            match entry {
                LogEntry::Insert(sample) => {
                    if let Err(e) = index.insert_sample(sample) {
                        debug!(target: targets::STORE, error = %e, "Skipping duplicate record during replay");
                    }
                }
                LogEntry::Purge { table, cutoff } => {
                    index.purge_samples(table, cutoff);
                }
            }
        }

        let replay = ReplayReport {
            records,
            live_samples: index.sample_count(),
            truncated_bytes,
        };
        info!(
            target: targets::STORE,
            path = %path.display(),
            records = replay.records,
            live_samples = replay.live_samples,
            "Sample log replayed"
        );

        Ok(Self {
            shared: Arc::new(LogShared {
                path,
                index,
                writer: Mutex::new(BufWriter::new(file)),
                sync_every_write,
                stats: LogStats::default(),
            }),
            replay,
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn replay_report(&self) -> ReplayReport {
        self.replay
    }

    pub fn records_appended(&self) -> u64 {
        self.shared.stats.records_appended.load(AtomicOrdering::Relaxed)
    }

    async fn blocking<T, F>(&self, operation: &'static str, work: F) -> MetricsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LogShared) -> MetricsResult<T> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || work(&shared))
            .await
            .map_err(|e| MetricsError::store_unavailable(operation, format!("log task failed: {e}")))?
    }

    /// Force appended records to disk.
    pub async fn sync(&self) -> MetricsResult<()> {
        self.blocking("sync", LogShared::sync).await
    }

    /// Rewrite the log so it holds only live samples. Purge records and the
    /// samples they removed are dropped.
    pub async fn compact(&self) -> MetricsResult<usize> {
        self.blocking("compact", LogShared::compact).await
    }
}

#[async_trait]
impl SampleStore for LogSampleStore {
    async fn insert(&self, sample: MetricSample) -> MetricsResult<()> {
        self.blocking("insert", move |shared| shared.insert(sample)).await
    }

    async fn get(&self, id: SampleId) -> MetricsResult<Option<MetricSample>> {
        Ok(self.shared.index.get_sample(id))
    }

    async fn scan(&self, filter: &SampleFilter) -> MetricsResult<Vec<MetricSample>> {
        Ok(self.shared.index.scan_samples(filter))
    }

    async fn latest(&self, entity_id: &str, signal_type: &SignalType) -> MetricsResult<Option<MetricSample>> {
        Ok(self.shared.index.latest_sample(entity_id, signal_type))
    }

    async fn count(&self, filter: &SampleFilter) -> MetricsResult<usize> {
        Ok(self.shared.index.count_samples(filter))
    }

    async fn purge_before(&self, table: SampleTable, cutoff: Timestamp) -> MetricsResult<usize> {
        self.blocking("purge", move |shared| shared.purge(table, cutoff)).await
    }

    async fn len(&self) -> MetricsResult<usize> {
        Ok(self.shared.index.sample_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::sample;

    #[tokio::test]
    async fn test_reopen_replays_inserts_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.log");

        let kept = sample("u1", "eeg", 20.0, 200);
        {
            let store = LogSampleStore::open(&path, false).unwrap();
            store.insert(sample("u1", "eeg", 10.0, 100)).await.unwrap();
            store.insert(kept.clone()).await.unwrap();
            store.purge_before(SampleTable::Biofeedback, Timestamp::from_secs(150)).await.unwrap();
            assert_eq!(store.records_appended(), 3);
        }

        let reopened = LogSampleStore::open(&path, false).unwrap();
        assert_eq!(reopened.replay_report().records, 3);
        assert_eq!(reopened.len().await.unwrap(), 1);
        assert_eq!(reopened.get(kept.sample_id).await.unwrap(), Some(kept));
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.log");
        {
            let store = LogSampleStore::open(&path, true).unwrap();
            store.insert(sample("u1", "eeg", 10.0, 100)).await.unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }

        let store = LogSampleStore::open(&path, false).unwrap();
        assert_eq!(store.replay_report().truncated_bytes, 6);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);
        assert_eq!(store.len().await.unwrap(), 1);

        store.insert(sample("u1", "eeg", 11.0, 101)).await.unwrap();
        drop(store);
        assert_eq!(LogSampleStore::open(&path, false).unwrap().replay_report().records, 2);
    }

    #[tokio::test]
    async fn test_corrupt_record_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.log");
        {
            let store = LogSampleStore::open(&path, false).unwrap();
            store.insert(sample("u1", "eeg", 10.0, 100)).await.unwrap();
            store.insert(sample("u1", "eeg", 11.0, 101)).await.unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let store = LogSampleStore::open(&path, false).unwrap();
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.replay_report().truncated_bytes > 0);
    }

    #[tokio::test]
    async fn test_compact_drops_purged_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.log");
        let store = LogSampleStore::open(&path, false).unwrap();
        for secs in 0..10 {
            store.insert(sample("u1", "cpu_usage", 1.0, secs)).await.unwrap();
        }
        store.purge_before(SampleTable::SystemMetrics, Timestamp::from_secs(8)).await.unwrap();
        let before = fs::metadata(&path).unwrap().len();

        assert_eq!(store.compact().await.unwrap(), 2);
        assert!(fs::metadata(&path).unwrap().len() < before);

        store.insert(sample("u1", "cpu_usage", 1.0, 20)).await.unwrap();
        drop(store);
        let reopened = LogSampleStore::open(&path, false).unwrap();
        assert_eq!(reopened.replay_report().records, 3);
        assert_eq!(reopened.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_busy_writer_times_out_instead_of_blocking() {
        use crate::store::TimedSampleStore;
        use std::time::{Duration, Instant};

        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(LogSampleStore::open(dir.path().join("samples.log"), false).unwrap());
        let timed = TimedSampleStore::new(log.clone(), Duration::from_millis(20));

        let held = log.shared.writer.lock();
        let started = Instant::now();
        let err = timed.insert(sample("u1", "eeg", 1.0, 1)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(250), "{:?}", started.elapsed());
        assert!(matches!(err, MetricsError::StoreUnavailable { .. }), "{err}");
        assert!(err.is_retryable());
        drop(held);

        timed.insert(sample("u1", "eeg", 2.0, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_compaction_keeps_appending_to_the_live_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.log");
        let store = LogSampleStore::open(&path, false).unwrap();
        store.insert(sample("u1", "eeg", 1.0, 1)).await.unwrap();

        // A directory where the scratch file belongs makes the rewrite fail.
        fs::create_dir(path.with_extension("compact")).unwrap();
        assert!(store.compact().await.is_err());
        assert!(path.with_extension("compact").is_dir());

        store.insert(sample("u1", "eeg", 2.0, 2)).await.unwrap();
        store.sync().await.unwrap();
        drop(store);

        let reopened = LogSampleStore::open(&path, false).unwrap();
        assert_eq!(reopened.replay_report().records, 2);
        assert_eq!(reopened.len().await.unwrap(), 2);
    }
}
