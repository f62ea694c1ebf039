//! File-backed transaction log
//!
//! Entries are bincode-encoded and length-prefixed (4 bytes, little endian)
//! in `txn.log`. A dedicated writer thread batches appends from all callers
//! and fsyncs them together: [`FileTxnLog::log_txn`] returns once its entry
//! is durable, so many concurrent commits share one fsync.
//!
//! The log also keeps an in-memory index of every transaction that has no
//! completion record yet. On open the file is replayed to rebuild it. Once
//! enough completions have piled up the log is compacted: the live entries are
//! rewritten to a temporary file that atomically replaces `txn.log`, and
//! `txn.checkpoint` (JSON) records the last LSN so numbering continues after
//! a restart.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TxnError};
use crate::txn::TxnStatus;
use crate::types::{TransactionUid, TxnKind};

use super::txnlog::{LoggedTransaction, TxnLog};

const LOG_FILE: &str = "txn.log";
const CHECKPOINT_FILE: &str = "txn.checkpoint";
const DURABLE_WAIT: Duration = Duration::from_secs(30);

/// Batching and fsync behavior of the writer thread
///
/// # Presets
///
/// - [`TxnLogConfig::default()`] - Balanced (20ms fsync interval)
/// - [`TxnLogConfig::synchronous()`] - fsync every batch
/// - [`TxnLogConfig::high_throughput()`] - Larger batches, longer fsync interval
#[derive(Debug, Clone)]
pub struct TxnLogConfig {
    /// Maximum time to wait for more entries before writing a batch (milliseconds)
    pub batch_timeout_ms: u64,
    /// Maximum entries in one batch
    pub max_batch_size: usize,
    /// How often to fsync (milliseconds). 0 syncs every batch.
    pub fsync_interval_ms: u64,
    /// Completed transactions accumulated before the log is compacted. 0 disables compaction.
    pub compact_threshold: usize,
}

impl Default for TxnLogConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 2,
            max_batch_size: 128,
            fsync_interval_ms: 20,
            compact_threshold: 10_000,
        }
    }
}

impl TxnLogConfig {
    pub fn synchronous() -> Self {
        Self {
            fsync_interval_ms: 0,
            ..Default::default()
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            batch_timeout_ms: 10,
            max_batch_size: 512,
            fsync_interval_ms: 100,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogOp {
    Txn(LoggedTransaction),
    Completion {
        uid: TransactionUid,
        kind: TxnKind,
        status: TxnStatus,
    },
    Checkpoint {
        live: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    lsn: u64,
    /// Unix epoch millis
    timestamp: u64,
    op: LogOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointInfo {
    lsn: u64,
    live: usize,
    timestamp: u64,
}

/// Transactions without a completion record, keyed by uid
#[derive(Default)]
struct LogIndex {
    live: HashMap<TransactionUid, (u64, LoggedTransaction)>,
    next_lsn: u64,
    completed_since_compact: usize,
}

impl LogIndex {
    fn apply(&mut self, lsn: u64, op: &LogOp) {
        match op {
            LogOp::Txn(txn) => {
                self.live.insert(txn.uid, (lsn, txn.clone()));
            }
            LogOp::Completion { uid, .. } => {
                self.live.remove(uid);
                self.completed_since_compact += 1;
            }
            LogOp::Checkpoint { .. } => {}
        }
        self.next_lsn = self.next_lsn.max(lsn + 1);
    }
}

/// Commit latch: callers block until their LSN has been fsynced
struct FsyncState {
    durable_lsn: AtomicU64,
    shutdown: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl FsyncState {
    fn new(durable: u64) -> Self {
        Self {
            durable_lsn: AtomicU64::new(durable),
            shutdown: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn durable_lsn(&self) -> u64 {
        self.durable_lsn.load(Ordering::Acquire)
    }

    fn wait_for_durable(&self, lsn: u64, timeout: Duration) -> Result<()> {
        if self.durable_lsn() >= lsn {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock();
        loop {
            if self.durable_lsn() >= lsn {
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(TxnError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "transaction log closed while waiting for fsync",
                )));
            }
            if self.condvar.wait_until(&mut guard, deadline).timed_out() && self.durable_lsn() < lsn {
                return Err(TxnError::Timeout(format!(
                    "Timeout waiting for LSN {} to become durable (current: {})",
                    lsn,
                    self.durable_lsn()
                )));
            }
        }
    }

    fn signal_durable(&self, lsn: u64) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

struct WriteRequest {
    lsn: u64,
    bytes: Vec<u8>,
    responder: mpsc::SyncSender<Result<()>>,
}

enum WriterMessage {
    Write(WriteRequest),
    /// Replace the whole file with these encoded entries
    Rewrite {
        entries: Vec<Vec<u8>>,
        last_lsn: u64,
        responder: mpsc::SyncSender<Result<()>>,
    },
    Shutdown,
}

pub struct FileTxnLog {
    dir: PathBuf,
    config: TxnLogConfig,
    index: Mutex<LogIndex>,
    sender: mpsc::SyncSender<WriterMessage>,
    fsync_state: Arc<FsyncState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileTxnLog {
    /// Open (or create) the log in `dir` and replay it
    pub fn open(dir: impl AsRef<Path>, config: TxnLogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log_path = dir.join(LOG_FILE);

        let mut index = LogIndex::default();
        if let Some(cp) = read_checkpoint(&dir.join(CHECKPOINT_FILE)) {
            log::info!("Transaction log checkpoint at LSN {} ({} live)", cp.lsn, cp.live);
            index.next_lsn = cp.lsn + 1;
        }
        let replayed = replay(&log_path, &mut index)?;
        index.next_lsn = index.next_lsn.max(1);
        index.completed_since_compact = 0;
        log::info!(
            "Replayed {} transaction log entries, {} incomplete transactions",
            replayed,
            index.live.len()
        );

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let (tx, rx) = mpsc::sync_channel::<WriterMessage>(10_000);
        let fsync_state = Arc::new(FsyncState::new(index.next_lsn - 1));

        let worker_state = Arc::clone(&fsync_state);
        let worker_config = config.clone();
        let worker_path = log_path.clone();
        let worker = thread::Builder::new()
            .name("txn-log-writer".to_string())
            .spawn(move || writer_thread(file, worker_path, rx, worker_config, worker_state))?;

        Ok(Self {
            dir,
            config,
            index: Mutex::new(index),
            sender: tx,
            fsync_state,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Number of transactions without a completion record
    pub fn incomplete_count(&self) -> usize {
        self.index.lock().live.len()
    }

    pub fn durable_lsn(&self) -> u64 {
        self.fsync_state.durable_lsn()
    }

    fn append(&self, op: LogOp) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        let lsn = {
            let mut index = self.index.lock();
            let lsn = index.next_lsn;
            let entry = LogEntry {
                lsn,
                timestamp: now_millis(),
                op,
            };
            let bytes = bincode::serialize(&entry)?;
            self.send(WriterMessage::Write(WriteRequest {
                lsn,
                bytes,
                responder: tx,
            }))?;
            // The channel preserves the order entries are applied here
            index.apply(lsn, &entry.op);
            lsn
        };
        rx.recv().map_err(|e| channel_closed("write response lost", e))??;
        self.fsync_state.wait_for_durable(lsn, DURABLE_WAIT)
    }

    fn send(&self, msg: WriterMessage) -> Result<()> {
        self.sender
            .send(msg)
            .map_err(|e| channel_closed("transaction log writer stopped", e))
    }

    /// Rewrite the log with only the incomplete transactions
    pub fn compact(&self) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        let (last_lsn, live) = {
            let mut index = self.index.lock();
            let mut live: Vec<&(u64, LoggedTransaction)> = index.live.values().collect();
            live.sort_by_key(|(lsn, _)| *lsn);

            let mut entries = Vec::with_capacity(live.len() + 1);
            for (lsn, txn) in live {
                entries.push(bincode::serialize(&LogEntry {
                    lsn: *lsn,
                    timestamp: now_millis(),
                    op: LogOp::Txn(txn.clone()),
                })?);
            }
            let last_lsn = index.next_lsn;
            let count = entries.len();
            entries.push(bincode::serialize(&LogEntry {
                lsn: last_lsn,
                timestamp: now_millis(),
                op: LogOp::Checkpoint { live: count },
            })?);

            self.send(WriterMessage::Rewrite {
                entries,
                last_lsn,
                responder: tx,
            })?;
            index.next_lsn = last_lsn + 1;
            index.completed_since_compact = 0;
            (last_lsn, count)
        };
        rx.recv().map_err(|e| channel_closed("compaction response lost", e))??;

        let info = CheckpointInfo {
            lsn: last_lsn,
            live,
            timestamp: now_millis(),
        };
        fs::write(self.dir.join(CHECKPOINT_FILE), serde_json::to_string_pretty(&info)?)?;
        log::info!("Transaction log compacted at LSN {}: {} incomplete transactions kept", last_lsn, live);
        Ok(())
    }

    fn maybe_compact(&self) {
        if self.config.compact_threshold == 0 {
            return;
        }
        if self.index.lock().completed_since_compact < self.config.compact_threshold {
            return;
        }
        if let Err(e) = self.compact() {
            log::warn!("Transaction log compaction failed: {}", e);
        }
    }

    /// Flush outstanding entries and stop the writer thread
    pub fn close(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.sender.send(WriterMessage::Shutdown);
            if worker.join().is_err() {
                log::error!("Transaction log writer panicked");
            }
        }
    }
}

impl TxnLog for FileTxnLog {
    fn log_txn(&self, txn: &LoggedTransaction) -> Result<()> {
        self.append(LogOp::Txn(txn.clone()))
    }

    fn log_txn_completion(&self, uid: TransactionUid, status: TxnStatus, kind: TxnKind) -> Result<()> {
        self.append(LogOp::Completion { uid, kind, status })?;
        self.maybe_compact();
        Ok(())
    }

    fn get_incomplete_transactions(&self, kind: TxnKind) -> Result<Vec<LoggedTransaction>> {
        let index = self.index.lock();
        let mut found: Vec<&(u64, LoggedTransaction)> =
            index.live.values().filter(|(_, txn)| txn.kind == kind).collect();
        found.sort_by_key(|(lsn, _)| *lsn);
        Ok(found.into_iter().map(|(_, txn)| txn.clone()).collect())
    }
}

impl Drop for FileTxnLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn channel_closed(what: &str, e: impl std::fmt::Display) -> TxnError {
    TxnError::Io(io::Error::new(io::ErrorKind::Other, format!("{}: {}", what, e)))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn read_checkpoint(path: &Path) -> Option<CheckpointInfo> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Failed to read checkpoint file '{}': {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(cp) => Some(cp),
        Err(e) => {
            log::warn!("Failed to parse checkpoint file: {}", e);
            None
        }
    }
}

/// Apply every readable entry of the log file to `index`. A torn entry at the
/// end of the file is cut off so later appends stay readable.
fn replay(path: &Path, index: &mut LogIndex) -> Result<usize> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut count = 0;
    let mut good_len: u64 = 0;
    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut buf = vec![0u8; len];
        match file.read_exact(&mut buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::warn!("Transaction log ends with a torn entry at offset {}; truncating", good_len);
                file.set_len(good_len)?;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        good_len += 4 + len as u64;

        let entry: LogEntry = match bincode::deserialize(&buf) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping malformed transaction log entry: {}", e);
                continue;
            }
        };
        index.apply(entry.lsn, &entry.op);
        count += 1;
    }
    Ok(count)
}

fn write_batch(file: &mut File, batch: &[Vec<u8>]) -> io::Result<usize> {
    let mut total = 0;
    for bytes in batch {
        file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        file.write_all(bytes)?;
        total += 4 + bytes.len();
    }
    file.flush()?;
    Ok(total)
}

fn rewrite(file: &mut File, path: &Path, entries: &[Vec<u8>]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    write_batch(tmp.as_file_mut(), entries)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| TxnError::Io(e.error))?;
    *file = OpenOptions::new().append(true).open(path)?;
    Ok(())
}

/// Writer thread: batches appends and fsyncs on an interval
fn writer_thread(
    mut file: File,
    path: PathBuf,
    rx: mpsc::Receiver<WriterMessage>,
    config: TxnLogConfig,
    fsync_state: Arc<FsyncState>,
) {
    let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
    let fsync_interval = Duration::from_millis(config.fsync_interval_ms);
    let deferred_fsync = config.fsync_interval_ms > 0;

    let mut last_fsync = Instant::now();
    let mut unsynced: usize = 0;
    let mut written_lsn = fsync_state.durable_lsn();

    loop {
        let mut batch: Vec<WriteRequest> = Vec::new();
        let mut rewrites = Vec::new();
        let mut should_shutdown = false;

        let wait = if deferred_fsync && unsynced > 0 {
            batch_timeout.min(fsync_interval.saturating_sub(last_fsync.elapsed()))
        } else {
            Duration::from_millis(100)
        };

        let mut next = rx.recv_timeout(wait);
        let deadline = Instant::now() + batch_timeout;
        loop {
            match next {
                Ok(WriterMessage::Write(req)) => batch.push(req),
                Ok(WriterMessage::Rewrite {
                    entries,
                    last_lsn,
                    responder,
                }) => {
                    rewrites.push((entries, last_lsn, responder));
                    break;
                }
                Ok(WriterMessage::Shutdown) => {
                    should_shutdown = true;
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    should_shutdown = true;
                    break;
                }
            }
            if batch.len() >= config.max_batch_size {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            next = rx.recv_timeout(remaining);
        }

        if !batch.is_empty() {
            let bytes: Vec<Vec<u8>> = batch.iter_mut().map(|r| std::mem::take(&mut r.bytes)).collect();
            match write_batch(&mut file, &bytes) {
                Ok(n) => {
                    unsynced += n;
                    if let Some(max) = batch.iter().map(|r| r.lsn).max() {
                        written_lsn = written_lsn.max(max);
                    }
                    for req in batch {
                        let _ = req.responder.send(Ok(()));
                    }
                    if bytes.len() > 1 {
                        log::debug!("Transaction log batch written: {} entries, {} bytes", bytes.len(), n);
                    }
                }
                Err(e) => {
                    log::error!("Transaction log write failed: {}", e);
                    let msg = e.to_string();
                    for req in batch {
                        let _ = req
                            .responder
                            .send(Err(TxnError::Io(io::Error::new(e.kind(), msg.clone()))));
                    }
                }
            }
        }

        let due = !deferred_fsync || last_fsync.elapsed() >= fsync_interval;
        if unsynced > 0 && (due || !rewrites.is_empty() || should_shutdown) {
            match file.sync_data() {
                Ok(()) => {
                    fsync_state.signal_durable(written_lsn);
                    unsynced = 0;
                    last_fsync = Instant::now();
                }
                Err(e) => log::error!("Transaction log fsync failed: {}", e),
            }
        }

        for (entries, last_lsn, responder) in rewrites {
            let result = rewrite(&mut file, &path, &entries);
            if result.is_ok() {
                written_lsn = written_lsn.max(last_lsn);
                fsync_state.signal_durable(written_lsn);
            }
            let _ = responder.send(result);
        }

        if should_shutdown {
            fsync_state.signal_shutdown();
            log::debug!("Transaction log writer shutting down");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{BrokerAddress, TransactionBroker, TransactionState, TransactionWork};
    use tempfile::tempdir;

    fn prepared(uid: u64) -> LoggedTransaction {
        LoggedTransaction::new(
            TransactionUid::new(uid),
            TxnKind::Local,
            TransactionState::new(1_000).with_status(TxnStatus::Prepared),
        )
        .with_work(TransactionWork::new())
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(TxnLogConfig::synchronous().fsync_interval_ms, 0);
        assert_eq!(TxnLogConfig::high_throughput().max_batch_size, 512);
    }

    #[test]
    fn test_log_and_complete() {
        let dir = tempdir().unwrap();
        let log = FileTxnLog::open(dir.path(), TxnLogConfig::synchronous()).unwrap();

        log.log_txn(&prepared(1)).unwrap();
        log.log_txn(&prepared(2)).unwrap();
        log.log_txn_completion(TransactionUid::new(1), TxnStatus::Committed, TxnKind::Local)
            .unwrap();

        let live = log.get_incomplete_transactions(TxnKind::Local).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].uid, TransactionUid::new(2));
        assert!(log.get_incomplete_transactions(TxnKind::Remote).unwrap().is_empty());
        assert!(log.durable_lsn() >= 3);
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = FileTxnLog::open(dir.path(), TxnLogConfig::default()).unwrap();
            log.log_txn(&prepared(10)).unwrap();
            let cluster = LoggedTransaction::new(
                TransactionUid::new(11),
                TxnKind::Cluster,
                TransactionState::new(0).with_status(TxnStatus::Committed),
            )
            .with_brokers(vec![TransactionBroker::new(BrokerAddress::new("peer", 7676))]);
            log.log_txn(&cluster).unwrap();
            log.log_txn_completion(TransactionUid::new(10), TxnStatus::RolledBack, TxnKind::Local)
                .unwrap();
        }

        let log = FileTxnLog::open(dir.path(), TxnLogConfig::default()).unwrap();
        assert!(log.get_incomplete_transactions(TxnKind::Local).unwrap().is_empty());
        let cluster = log.get_incomplete_transactions(TxnKind::Cluster).unwrap();
        assert_eq!(cluster.len(), 1);
        assert_eq!(cluster[0].brokers.as_ref().unwrap().len(), 1);
        assert_eq!(cluster[0].state.status(), TxnStatus::Committed);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        {
            let log = FileTxnLog::open(dir.path(), TxnLogConfig::synchronous()).unwrap();
            log.log_txn(&prepared(20)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(dir.path().join(LOG_FILE)).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let log = FileTxnLog::open(dir.path(), TxnLogConfig::synchronous()).unwrap();
        assert_eq!(log.incomplete_count(), 1);
    }

    #[test]
    fn test_compact_keeps_live_entries_and_lsn() {
        let dir = tempdir().unwrap();
        let before;
        {
            let log = FileTxnLog::open(dir.path(), TxnLogConfig::synchronous()).unwrap();
            for uid in 1..=5 {
                log.log_txn(&prepared(uid)).unwrap();
            }
            for uid in 1..=4 {
                log.log_txn_completion(TransactionUid::new(uid), TxnStatus::Committed, TxnKind::Local)
                    .unwrap();
            }
            let size = fs::metadata(log.path()).unwrap().len();
            log.compact().unwrap();
            assert!(fs::metadata(log.path()).unwrap().len() < size);
            before = log.durable_lsn();
        }
        assert!(dir.path().join(CHECKPOINT_FILE).exists());

        let log = FileTxnLog::open(dir.path(), TxnLogConfig::synchronous()).unwrap();
        let live = log.get_incomplete_transactions(TxnKind::Local).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].uid, TransactionUid::new(5));

        log.log_txn(&prepared(6)).unwrap();
        assert!(log.durable_lsn() > before);
    }

    #[test]
    fn test_automatic_compaction() {
        let dir = tempdir().unwrap();
        let config = TxnLogConfig {
            compact_threshold: 2,
            ..TxnLogConfig::synchronous()
        };
        let log = FileTxnLog::open(dir.path(), config).unwrap();
        for uid in 1..=3 {
            log.log_txn(&prepared(uid)).unwrap();
        }
        log.log_txn_completion(TransactionUid::new(1), TxnStatus::Committed, TxnKind::Local)
            .unwrap();
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
        log.log_txn_completion(TransactionUid::new(2), TxnStatus::Committed, TxnKind::Local)
            .unwrap();
        assert!(dir.path().join(CHECKPOINT_FILE).exists());
        assert_eq!(log.incomplete_count(), 1);
    }
}
