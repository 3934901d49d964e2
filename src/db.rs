//! Database façade: lifecycle, the write path, and the flush engine.
//!
//! A database directory contains:
//!
//! - `FLOCK` — the exclusive-open sentinel;
//! - `DEPMETA` — the persisted deprecated/total record counters;
//! - one `<table_id:09>/` WAL directory per resident memtable;
//! - `.vlog.<p>` value-log segments and `.index.<p>` / `.hindex.<p>` index
//!   edit logs, one set per partition.
//!
//! Three long-lived workers run per open database: the flush consumer
//! (drains sealed memtables into the value log and index), the auto-compact
//! consumer (acts on threshold signals from flushes), and the disk-IO
//! sampler (Linux only). Shutdown is two-phase: close a worker's input,
//! then await its drain.
//!
//! `Db::open` must be called from within a tokio runtime; all public
//! operations except `close`, `flush`, and the compaction entry points are
//! synchronous.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::batch::{Batch, BatchIdSource, BatchPool};
use crate::compaction::{self, CompactionStrategy};
use crate::config::{BatchOptions, Options, WriteOptions};
use crate::diskio::DiskIo;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::{open_index, Index, IndexOptions, MatchKeyFn};
use crate::memtable::{
    now_unix, open_all_memtables, Memtable, MemtableOptions, RecordKind,
};
use crate::vlog::{ValueLog, ValueLogOptions, ValueLogRecord};

const FILE_LOCK_NAME: &str = "FLOCK";
const DEPRECATED_META_NAME: &str = "DEPMETA";

/// Signal from the flush engine to the auto-compactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThresholdState {
    /// Compact only if the disk is idle.
    ArriveLowerThreshold,
    /// Compact now.
    ArriveUpperThreshold,
}

/// Mutable state guarded by the database lock: the active memtable, the
/// sealed memtables awaiting flush, and the closed flag.
pub(crate) struct DbState {
    pub(crate) active: Arc<Memtable>,
    pub(crate) immutables: Vec<Arc<Memtable>>,
    pub(crate) next_table_id: u32,
    pub(crate) closed: bool,
}

pub(crate) struct DbInner {
    pub(crate) options: Options,
    pub(crate) state: RwLock<DbState>,
    pub(crate) index: Index,
    pub(crate) vlog: ValueLog,
    /// Serializes flush against compaction. Never held while `state` is
    /// held.
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
    pub(crate) flush_tx: Mutex<Option<mpsc::Sender<Arc<Memtable>>>>,
    pub(crate) compact_tx: Mutex<Option<mpsc::Sender<ThresholdState>>>,
    pub(crate) diskio: Arc<DiskIo>,
    pub(crate) batch_pool: BatchPool,
    pub(crate) batch_ids: BatchIdSource,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    file_lock: Mutex<Option<FileLock>>,
    closed: AtomicBool,
}

/// An embedded, durable, ordered key-value store.
///
/// Thread-safe: any number of concurrent readers and writers may share one
/// handle. A directory can only be opened by one process at a time;
/// [`Error::DatabaseIsUsing`] is returned otherwise.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    pub(crate) fn inner(&self) -> &DbInner {
        &self.inner
    }

    /// Opens a database, creating the directory if needed.
    ///
    /// Rebuilds every resident memtable from its WAL, opens the index and
    /// value log, and starts the background workers. Must be called from
    /// within a tokio runtime.
    pub fn open(mut options: Options) -> Result<Db> {
        options.validate()?;
        std::fs::create_dir_all(&options.dir_path)?;

        let file_lock = FileLock::try_lock(options.dir_path.join(FILE_LOCK_NAME))
            .map_err(|_| Error::DatabaseIsUsing)?;

        let (deprecated_number, total_number) =
            read_deprecated_meta(&options.dir_path.join(DEPRECATED_META_NAME))?;
        tracing::debug!(deprecated_number, total_number, "recovered deprecated counters");

        // A crash mid-compaction can leave rewrite targets behind; their
        // partitions were never swapped, so the temp files are garbage.
        remove_stale_temp_files(&options.dir_path)?;

        let mut tables = open_all_memtables(&options)?;
        let active = Arc::new(tables.pop().expect("at least one memtable"));
        let immutables: Vec<Arc<Memtable>> = tables.into_iter().map(Arc::new).collect();
        let next_table_id = active.table_id() + 1;

        let index = open_index(IndexOptions {
            index_type: options.index_type,
            dir_path: options.dir_path.clone(),
            partition_num: options.partition_num as u32,
            key_hash_function: options.key_hash_function,
        })?;

        let vlog = ValueLog::open(ValueLogOptions {
            dir_path: options.dir_path.clone(),
            segment_size: options.value_log_file_size,
            block_cache: options.block_cache,
            partition_num: options.partition_num as u32,
            key_hash_function: options.key_hash_function,
            deprecated_number,
            total_number,
        })?;

        let diskio = Arc::new(DiskIo::new(
            options.dir_path.clone(),
            options.disk_io_sampling_interval,
            options.disk_io_busy_rate,
        ));

        let flush_capacity = (options.memtable_nums - 1).max(immutables.len()).max(1);
        let (flush_tx, flush_rx) = mpsc::channel(flush_capacity);
        let (compact_tx, compact_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);

        let auto_compact = options.auto_compact;
        let inner = Arc::new(DbInner {
            options,
            state: RwLock::new(DbState {
                active,
                immutables: immutables.clone(),
                next_table_id,
                closed: false,
            }),
            index,
            vlog,
            flush_lock: tokio::sync::Mutex::new(()),
            flush_tx: Mutex::new(Some(flush_tx.clone())),
            compact_tx: Mutex::new(auto_compact.then(|| compact_tx)),
            diskio: diskio.clone(),
            batch_pool: BatchPool::new(),
            batch_ids: BatchIdSource::new(),
            shutdown_tx: shutdown_tx.clone(),
            workers: Mutex::new(Vec::new()),
            file_lock: Mutex::new(Some(file_lock)),
            closed: AtomicBool::new(false),
        });

        let mut workers = Vec::new();
        workers.push(tokio::spawn(flush_worker(inner.clone(), flush_rx)));
        if auto_compact {
            workers.push(tokio::spawn(compact_worker(inner.clone(), compact_rx)));
        }
        if DiskIo::supported() {
            workers.push(tokio::spawn(diskio.run(shutdown_tx.subscribe())));
        }
        *inner.workers.lock()? = workers;

        // Memtables sealed before the previous shutdown go straight to the
        // flush queue; they stay readable until the worker drains them.
        for table in immutables {
            if let Err(e) = flush_tx.try_send(table) {
                tracing::error!(error = %e, "failed to queue recovered memtable for flush");
            }
        }

        Ok(Db { inner })
    }

    /// Closes the database: drains the background workers, closes all data
    /// files, persists the deprecated counters, and releases the directory
    /// lock. The handle is unusable afterwards.
    pub async fn close(&self) -> Result<()> {
        if self.inner.state.read()?.closed {
            return Err(Error::DatabaseClosed);
        }

        // Phase one: close worker inputs. Dropping the senders lets the
        // flush worker finish its queue before exiting.
        self.inner.flush_tx.lock()?.take();
        self.inner.compact_tx.lock()?.take();
        let _ = self.inner.shutdown_tx.send(());

        // Phase two: wait for the drain.
        let workers: Vec<_> = self.inner.workers.lock()?.drain(..).collect();
        for worker in workers {
            worker.await?;
        }

        {
            let mut state = self.inner.state.write()?;
            for table in &state.immutables {
                table.close()?;
            }
            state.active.close()?;
            state.closed = true;
        }

        self.inner.index.close()?;
        write_deprecated_meta(
            &self.inner.options.dir_path.join(DEPRECATED_META_NAME),
            self.inner.vlog.deprecated_number(),
            self.inner.vlog.total_number(),
        )?;
        self.inner.vlog.close()?;

        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.file_lock.lock()?.take();
        Ok(())
    }

    /// Fsyncs every memtable WAL, the index, and the value log.
    pub fn sync(&self) -> Result<()> {
        let state = self.inner.state.read()?;
        if state.closed {
            return Err(Error::DatabaseClosed);
        }
        for table in &state.immutables {
            table.sync()?;
        }
        state.active.sync()?;
        drop(state);

        self.inner.index.sync()?;
        self.inner.vlog.sync()?;
        Ok(())
    }

    /// Writes a key-value pair with default write options.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_options(key, value, WriteOptions::default())
    }

    /// Writes a key-value pair. Opens a one-operation batch and commits it.
    pub fn put_with_options(&self, key: &[u8], value: &[u8], options: WriteOptions) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions {
            sync: options.sync,
            disable_wal: options.disable_wal,
            read_only: false,
        })?;
        batch.put(key, value)?;
        batch.commit()
    }

    /// Writes a key-value pair that expires `ttl` from now.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions::default())?;
        batch.put_with_expiry(key, value, now_unix() + ttl.as_secs() as i64)?;
        batch.commit()
    }

    /// Reads the value of `key`, or [`Error::KeyNotFound`].
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut batch = self.new_batch(BatchOptions {
            read_only: true,
            ..Default::default()
        })?;
        let result = batch.get(key);
        batch.commit()?;
        result
    }

    /// Deletes `key` with default write options. Deleting an absent key
    /// succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_with_options(key, WriteOptions::default())
    }

    /// Deletes `key`. Opens a one-operation batch and commits it.
    pub fn delete_with_options(&self, key: &[u8], options: WriteOptions) -> Result<()> {
        let mut batch = self.new_batch(BatchOptions {
            sync: options.sync,
            disable_wal: options.disable_wal,
            read_only: false,
        })?;
        batch.delete(key)?;
        batch.commit()
    }

    /// Whether `key` exists.
    pub fn exist(&self, key: &[u8]) -> Result<bool> {
        let mut batch = self.new_batch(BatchOptions {
            read_only: true,
            ..Default::default()
        })?;
        let result = batch.exist(key);
        batch.commit()?;
        result
    }

    /// Starts a new batch. A writing batch holds the database write lock
    /// until committed, rolled back, or dropped.
    pub fn new_batch(&self, options: BatchOptions) -> Result<Batch<'_>> {
        Batch::new(self, options)
    }

    /// Seals the active memtable and flushes every resident memtable to the
    /// value log and index before returning. A durability barrier: after
    /// this, nothing readable depends on memtable WALs.
    pub async fn flush(&self) -> Result<()> {
        let tables: Vec<Arc<Memtable>> = {
            let mut state = self.inner.state.write()?;
            if state.closed {
                return Err(Error::DatabaseClosed);
            }
            if !state.active.is_empty() {
                let sealed = state.active.clone();
                state.immutables.push(sealed);
                let table_id = state.next_table_id;
                state.next_table_id += 1;
                state.active = Arc::new(Memtable::open(self.inner.memtable_options(table_id))?);
            }
            state.immutables.clone()
        };

        for table in tables {
            self.inner.flush_memtable(table).await?;
        }
        Ok(())
    }

    /// Full-scan compaction: rewrites every value-log partition keeping only
    /// the records the index still points at.
    pub async fn compact(&self) -> Result<()> {
        if self.inner.state.read()?.closed {
            return Err(Error::DatabaseClosed);
        }
        compaction::run_compaction(self.inner.clone(), CompactionStrategy::FullScan).await
    }

    /// Deprecated-driven compaction: rewrites every value-log partition
    /// dropping the records whose UIDs are in the deprecated sets.
    pub async fn compact_with_deprecated_table(&self) -> Result<()> {
        if self.inner.state.read()?.closed {
            return Err(Error::DatabaseClosed);
        }
        compaction::run_compaction(self.inner.clone(), CompactionStrategy::DeprecatedDriven).await
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        // Dropped without close: stop worker intake and release the
        // directory lock so the next open can proceed. Unflushed memtables
        // keep their WALs and replay at next open.
        tracing::warn!("database dropped without close");
        if let Ok(mut tx) = self.inner.flush_tx.lock() {
            tx.take();
        }
        if let Ok(mut tx) = self.inner.compact_tx.lock() {
            tx.take();
        }
        let _ = self.inner.shutdown_tx.send(());
        if let Ok(mut lock) = self.inner.file_lock.lock() {
            lock.take();
        }
    }
}

impl DbInner {
    pub(crate) fn memtable_options(&self, table_id: u32) -> MemtableOptions {
        MemtableOptions {
            table_id,
            ..MemtableOptions::new(&self.options)
        }
    }

    /// Ensures the active memtable can take another batch, rotating it into
    /// the flush queue when full. Called with the state write lock held; on
    /// backpressure it waits up to `wait_mem_space_timeout` for the flush
    /// worker to free a queue slot.
    pub(crate) fn wait_memtable_space(&self, state: &mut DbState) -> Result<()> {
        if !state.active.is_full() {
            return Ok(());
        }

        let deadline = Instant::now() + self.options.wait_mem_space_timeout;
        loop {
            let sent = {
                let sender = self.flush_tx.lock()?;
                match sender.as_ref() {
                    Some(sender) => sender.try_send(state.active.clone()),
                    None => return Err(Error::DatabaseClosed),
                }
            };
            match sent {
                Ok(()) => {
                    state.immutables.push(state.active.clone());
                    let table_id = state.next_table_id;
                    state.next_table_id += 1;
                    state.active = Arc::new(Memtable::open(self.memtable_options(table_id))?);
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::WaitMemtableSpaceTimeout);
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(Error::DatabaseClosed);
                }
            }
        }
    }

    /// On-disk lookup: index position first, then the value log record.
    pub(crate) fn get_from_disk(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let match_fn = self
            .index
            .needs_match_keys()
            .then(|| self.vlog_match_fn(key.to_vec()));
        let position = self.index.get(key, match_fn.as_ref())?;
        match position {
            Some(pos) => {
                let record = self.vlog.read(pos.partition, pos.position)?;
                Ok(Some(record.value))
            }
            None => Ok(None),
        }
    }

    /// Match fn for the hash index: a candidate slot belongs to `key` iff
    /// the value-log record it points at carries the same key bytes.
    pub(crate) fn vlog_match_fn(&self, key: Vec<u8>) -> MatchKeyFn<'_> {
        Box::new(move |slot| {
            let record = self.vlog.read(slot.partition, slot.position)?;
            Ok(record.key == key)
        })
    }

    /// Drains one sealed memtable to the value log and index.
    ///
    /// On any failure the memtable stays resident (still readable, still
    /// durable through its WAL) and will be flushed again by a later signal
    /// or at next open.
    pub(crate) async fn flush_memtable(&self, table: Arc<Memtable>) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        // Another path may have flushed this table while we waited.
        {
            let state = self.state.read()?;
            let present = Arc::ptr_eq(&table, &state.active)
                || state.immutables.iter().any(|t| Arc::ptr_eq(t, &table));
            if !present {
                return Ok(());
            }
        }
        let table_id = table.table_id();

        // Split entries into tombstones and live records; entries already
        // expired at flush time count as tombstones.
        let now = now_unix();
        let mut deleted_keys: Vec<Vec<u8>> = Vec::new();
        let mut records: Vec<ValueLogRecord> = Vec::new();
        for (key, mv) in table.iter() {
            if mv.kind == RecordKind::Tombstone || (mv.expires_at > 0 && mv.expires_at <= now) {
                deleted_keys.push(key);
            } else {
                records.push(ValueLogRecord::new(key, mv.value));
            }
        }
        let record_count = records.len();
        let deleted_count = deleted_keys.len();

        let positions = self.vlog.write_batch(&records)?;
        self.vlog.sync()?;

        let put_match: Option<Vec<MatchKeyFn<'_>>> = self.index.needs_match_keys().then(|| {
            positions
                .iter()
                .map(|pos| self.vlog_match_fn(pos.key.clone()))
                .collect()
        });
        let previous = self.index.put_batch(&positions, put_match.as_deref())?;
        for old in &previous {
            self.vlog.set_deprecated(old.partition, old.uid);
        }

        let delete_match: Option<Vec<MatchKeyFn<'_>>> = self.index.needs_match_keys().then(|| {
            deleted_keys
                .iter()
                .map(|key| self.vlog_match_fn(key.clone()))
                .collect()
        });
        let removed = self.index.delete_batch(&deleted_keys, delete_match.as_deref())?;
        for old in &removed {
            self.vlog.set_deprecated(old.partition, old.uid);
        }

        self.index.sync()?;
        table.delete_wal()?;

        {
            let mut state = self.state.write()?;
            state.immutables.retain(|t| !Arc::ptr_eq(t, &table));
            if Arc::ptr_eq(&table, &state.active) {
                // Flush-on-close path: the active memtable itself was
                // drained, so install a fresh one.
                let table_id = state.next_table_id;
                state.next_table_id += 1;
                state.active = Arc::new(Memtable::open(self.memtable_options(table_id))?);
            }
        }
        drop(_guard);

        tracing::info!(
            table_id,
            records = record_count,
            deletions = deleted_count,
            "memtable flushed"
        );

        self.evaluate_compaction_thresholds();
        Ok(())
    }

    /// Step after every flush: signal the compactor when the deprecated
    /// share of the value log crosses a threshold.
    fn evaluate_compaction_thresholds(&self) {
        if !self.options.auto_compact {
            return;
        }
        let total = self.vlog.total_number();
        let deprecated = self.vlog.deprecated_number();
        if deprecated == 0 {
            return;
        }
        let lower = (total as f32 * self.options.deprecated_table_lower_rate) as u32;
        let upper = (total as f32 * self.options.deprecated_table_upper_rate) as u32;
        tracing::debug!(deprecated, total, lower, upper, "deprecated table state after flush");

        let signal = if deprecated >= upper {
            Some(ThresholdState::ArriveUpperThreshold)
        } else if deprecated > lower {
            Some(ThresholdState::ArriveLowerThreshold)
        } else {
            None
        };
        if let Some(signal) = signal {
            if let Ok(sender) = self.compact_tx.lock() {
                if let Some(sender) = sender.as_ref() {
                    // A full channel means a signal is already pending;
                    // signals are coalesced on the receiving side anyway.
                    let _ = sender.try_send(signal);
                }
            }
        }
    }
}

/// Consumes sealed memtables from the flush queue until the queue closes.
async fn flush_worker(inner: Arc<DbInner>, mut rx: mpsc::Receiver<Arc<Memtable>>) {
    loop {
        tokio::select! {
            table = rx.recv() => match table {
                Some(table) => {
                    if let Err(e) = inner.flush_memtable(table).await {
                        tracing::error!(error = %e, "memtable flush failed, table kept for retry");
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("flush worker exiting on interrupt");
                return;
            }
        }
    }
    tracing::debug!("flush worker drained and stopped");
}

/// Acts on threshold signals from the flush engine. The first compaction
/// after open is always a full scan, because deprecations recorded before
/// the previous shutdown are not in the in-memory sets.
async fn compact_worker(inner: Arc<DbInner>, mut rx: mpsc::Receiver<ThresholdState>) {
    let mut first_compact = true;
    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                Some(threshold) => {
                    let run = match threshold {
                        ThresholdState::ArriveUpperThreshold => true,
                        ThresholdState::ArriveLowerThreshold => {
                            let free = inner.diskio.is_free();
                            if !free {
                                tracing::info!("disk busy, skipping opportunistic compaction");
                            }
                            free
                        }
                    };
                    if run {
                        let strategy = if first_compact {
                            first_compact = false;
                            CompactionStrategy::FullScan
                        } else {
                            CompactionStrategy::DeprecatedDriven
                        };
                        if let Err(e) = compaction::run_compaction(inner.clone(), strategy).await {
                            tracing::error!(error = %e, "auto compaction failed");
                        }
                    }
                    // Coalesce whatever piled up while compacting.
                    while rx.try_recv().is_ok() {}
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("compaction worker exiting on interrupt");
                return;
            }
        }
    }
    tracing::debug!("compaction worker drained and stopped");
}

/// Reads the persisted counters; creates the file with zeroed counters when
/// absent. A short or unreadable file (crash before the first clean close)
/// falls back to zeroes.
fn read_deprecated_meta(path: &Path) -> Result<(u32, u32)> {
    if !path.exists() {
        write_deprecated_meta(path, 0, 0)?;
        return Ok((0, 0));
    }
    let mut file = File::open(path)?;
    let deprecated = file.read_u32::<LittleEndian>();
    let total = file.read_u32::<LittleEndian>();
    match (deprecated, total) {
        (Ok(deprecated), Ok(total)) => Ok((deprecated, total)),
        _ => {
            tracing::warn!(path = %path.display(), "unreadable deprecated counters, resetting");
            Ok((0, 0))
        }
    }
}

fn write_deprecated_meta(path: &Path, deprecated: u32, total: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_u32::<LittleEndian>(deprecated)?;
    file.write_u32::<LittleEndian>(total)?;
    file.sync_all()?;
    Ok(())
}

/// Removes `.tvlog.*` rewrite targets left behind by a crashed compaction.
fn remove_stale_temp_files(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if name.contains(".tvlog.") {
                tracing::warn!(file = name, "removing stale compaction temp file");
                std::fs::remove_file(entry.path())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexType;
    use tempfile::TempDir;

    fn test_options(dir: &TempDir) -> Options {
        Options::new(dir.path())
    }

    /// Small memtables and fast timeouts so rotation paths trigger quickly.
    fn small_options(dir: &TempDir) -> Options {
        Options::new(dir.path())
            .memtable_size(4 * 1024)
            .memtable_nums(4)
            .partition_num(2)
            .wait_mem_space_timeout(Duration::from_millis(200))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_initializes_state() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        {
            let state = db.inner.state.read().unwrap();
            assert!(!state.closed);
            assert!(state.immutables.is_empty());
            assert_eq!(state.active.size(), 0);
        }
        assert!(dir.path().join("FLOCK").exists());
        assert!(dir.path().join("DEPMETA").exists());

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_operations_after_close_fail() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();
        db.close().await.unwrap();

        assert!(matches!(db.put(b"k", b"v"), Err(Error::DatabaseClosed)));
        assert!(matches!(db.get(b"k"), Err(Error::DatabaseClosed)));
        assert!(matches!(db.sync(), Err(Error::DatabaseClosed)));
        assert!(matches!(db.close().await, Err(Error::DatabaseClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_get_roundtrip_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = Db::open(test_options(&dir)).unwrap();
            assert!(matches!(db.get(b"Hello"), Err(Error::KeyNotFound)));

            db.put(b"Hello", b"World").unwrap();
            assert_eq!(db.get(b"Hello").unwrap(), b"World");

            for i in 0..100 {
                let key = format!("key-{i:04}").into_bytes();
                let value = vec![i as u8; 128];
                db.put(&key, &value).unwrap();
            }
            db.close().await.unwrap();
        }

        let db = Db::open(test_options(&dir)).unwrap();
        assert_eq!(db.get(b"Hello").unwrap(), b"World");
        for i in 0..100 {
            let key = format!("key-{i:04}").into_bytes();
            assert_eq!(db.get(&key).unwrap(), vec![i as u8; 128]);
        }
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_and_exist() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        db.put(b"Lumia", b"Qian").unwrap();
        assert!(db.exist(b"Lumia").unwrap());

        db.delete(b"Lumia").unwrap();
        assert!(!db.exist(b"Lumia").unwrap());
        assert!(matches!(db.get(b"Lumia"), Err(Error::KeyNotFound)));

        // Deleting an absent key succeeds.
        db.delete(b"Hello").unwrap();

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_value_is_not_missing() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        db.put(b"empty", b"").unwrap();
        assert_eq!(db.get(b"empty").unwrap(), Vec::<u8>::new());
        assert!(db.exist(b"empty").unwrap());

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_last_write_wins_and_read_your_writes() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        let mut batch = db.new_batch(BatchOptions::default()).unwrap();
        batch.put(b"k", b"v1").unwrap();
        batch.put(b"k", b"v2").unwrap();
        assert_eq!(batch.get(b"k").unwrap(), b"v2");
        batch.delete(b"k").unwrap();
        assert!(!batch.exist(b"k").unwrap());
        batch.put(b"k", b"v3").unwrap();
        batch.commit().unwrap();

        assert_eq!(db.get(b"k").unwrap(), b"v3");
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batch_misuse_errors() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        let mut batch = db.new_batch(BatchOptions::default()).unwrap();
        batch.put(b"k", b"v").unwrap();
        batch.commit().unwrap();
        assert!(matches!(batch.commit(), Err(Error::BatchCommitted)));
        assert!(matches!(batch.put(b"k", b"v"), Err(Error::BatchCommitted)));
        drop(batch);

        let mut batch = db.new_batch(BatchOptions::default()).unwrap();
        batch.put(b"x", b"y").unwrap();
        batch.rollback().unwrap();
        assert!(matches!(batch.get(b"x"), Err(Error::BatchRolledBack)));
        drop(batch);
        assert!(matches!(db.get(b"x"), Err(Error::KeyNotFound)));

        let mut read_only = db
            .new_batch(BatchOptions {
                read_only: true,
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(read_only.put(b"k", b"v"), Err(Error::ReadOnlyBatch)));
        read_only.commit().unwrap();

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_batch_discards_writes() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        {
            let mut batch = db.new_batch(BatchOptions::default()).unwrap();
            batch.put(b"ghost", b"v").unwrap();
        }
        assert!(matches!(db.get(b"ghost"), Err(Error::KeyNotFound)));

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_value_too_big() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(small_options(&dir)).unwrap();

        let oversized = vec![0u8; 8 * 1024];
        assert!(matches!(db.put(b"big", &oversized), Err(Error::ValueTooBig)));

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();
        assert!(db.put(b"", b"v").is_err());
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_flush_keeps_data_visible() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        for i in 0..50 {
            db.put(format!("key-{i}").as_bytes(), format!("val-{i}").as_bytes())
                .unwrap();
        }
        db.flush().await.unwrap();

        // Memtables are gone; reads now come from index + value log.
        assert!(db.inner.state.read().unwrap().immutables.is_empty());
        for i in 0..50 {
            assert_eq!(
                db.get(format!("key-{i}").as_bytes()).unwrap(),
                format!("val-{i}").into_bytes()
            );
        }
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_overrides_flushed_put() {
        let dir = TempDir::new().unwrap();
        {
            let db = Db::open(test_options(&dir)).unwrap();
            db.put(b"K", b"V1").unwrap();
            db.flush().await.unwrap();

            db.delete(b"K").unwrap();
            assert!(matches!(db.get(b"K"), Err(Error::KeyNotFound)));
            db.close().await.unwrap();
        }

        let db = Db::open(test_options(&dir)).unwrap();
        assert!(matches!(db.get(b"K"), Err(Error::KeyNotFound)));
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overwrite_increments_deprecated() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir).auto_compact(false)).unwrap();

        for i in 0..100 {
            db.put(format!("key-{i}").as_bytes(), b"first").unwrap();
        }
        db.flush().await.unwrap();
        assert_eq!(db.inner.vlog.deprecated_number(), 0);

        for i in 0..100 {
            db.put(format!("key-{i}").as_bytes(), b"second").unwrap();
        }
        db.flush().await.unwrap();

        assert!(db.inner.vlog.deprecated_number() >= 100);
        assert!(db.inner.vlog.total_number() >= 200);
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_compaction_preserves_data() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir).auto_compact(false)).unwrap();

        for i in 0..1000 {
            db.put(format!("key-{i:04}").as_bytes(), b"original").unwrap();
        }
        db.flush().await.unwrap();
        for i in 0..500 {
            db.put(format!("key-{i:04}").as_bytes(), b"rewritten").unwrap();
        }
        for i in 500..750 {
            db.delete(format!("key-{i:04}").as_bytes()).unwrap();
        }
        db.flush().await.unwrap();
        assert!(db.inner.vlog.deprecated_number() >= 750);

        db.compact().await.unwrap();
        assert_eq!(db.inner.vlog.deprecated_number(), 0);

        for i in 0..500 {
            assert_eq!(db.get(format!("key-{i:04}").as_bytes()).unwrap(), b"rewritten");
        }
        for i in 500..750 {
            assert!(matches!(
                db.get(format!("key-{i:04}").as_bytes()),
                Err(Error::KeyNotFound)
            ));
        }
        for i in 750..1000 {
            assert_eq!(db.get(format!("key-{i:04}").as_bytes()).unwrap(), b"original");
        }
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deprecated_driven_compaction() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir).auto_compact(false)).unwrap();

        for i in 0..200 {
            db.put(format!("key-{i:03}").as_bytes(), b"v1").unwrap();
        }
        db.flush().await.unwrap();
        for i in 0..100 {
            db.put(format!("key-{i:03}").as_bytes(), b"v2").unwrap();
        }
        db.flush().await.unwrap();

        db.compact_with_deprecated_table().await.unwrap();

        for i in 0..100 {
            assert_eq!(db.get(format!("key-{i:03}").as_bytes()).unwrap(), b"v2");
        }
        for i in 100..200 {
            assert_eq!(db.get(format!("key-{i:03}").as_bytes()).unwrap(), b"v1");
        }
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_compaction_with_hash_index() {
        let dir = TempDir::new().unwrap();
        let options = test_options(&dir)
            .index_type(IndexType::Hash)
            .auto_compact(false);
        let db = Db::open(options).unwrap();

        for i in 0..200 {
            db.put(format!("key-{i:03}").as_bytes(), b"v1").unwrap();
        }
        db.flush().await.unwrap();
        for i in 0..100 {
            db.put(format!("key-{i:03}").as_bytes(), b"v2").unwrap();
        }
        for i in 100..150 {
            db.delete(format!("key-{i:03}").as_bytes()).unwrap();
        }
        db.flush().await.unwrap();

        db.compact().await.unwrap();

        for i in 0..100 {
            assert_eq!(db.get(format!("key-{i:03}").as_bytes()).unwrap(), b"v2");
        }
        for i in 100..150 {
            assert!(matches!(
                db.get(format!("key-{i:03}").as_bytes()),
                Err(Error::KeyNotFound)
            ));
        }
        for i in 150..200 {
            assert_eq!(db.get(format!("key-{i:03}").as_bytes()).unwrap(), b"v1");
        }
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_directory_lock_excludes_second_open() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        match Db::open(test_options(&dir)) {
            Err(Error::DatabaseIsUsing) => {}
            other => panic!("expected DatabaseIsUsing, got {:?}", other.map(|_| ())),
        }

        db.close().await.unwrap();
        let db2 = Db::open(test_options(&dir)).unwrap();
        db2.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crash_recovery_keeps_synced_writes() {
        let dir = TempDir::new().unwrap();
        let sync_options = WriteOptions {
            sync: true,
            disable_wal: false,
        };
        {
            let db = Db::open(test_options(&dir)).unwrap();
            for i in 0..100 {
                db.put_with_options(
                    format!("synced-{i}").as_bytes(),
                    b"durable",
                    sync_options,
                )
                .unwrap();
            }
            // Simulated crash: dropped without close.
            drop(db);
        }

        let db = Db::open(test_options(&dir)).unwrap();
        for i in 0..100 {
            assert_eq!(db.get(format!("synced-{i}").as_bytes()).unwrap(), b"durable");
        }

        // Unlogged writes may vanish on crash, but must not take the synced
        // ones with them.
        let volatile_options = WriteOptions {
            sync: false,
            disable_wal: true,
        };
        for i in 0..100 {
            db.put_with_options(
                format!("volatile-{i}").as_bytes(),
                b"maybe",
                volatile_options,
            )
            .unwrap();
        }
        drop(db);

        let db = Db::open(test_options(&dir)).unwrap();
        for i in 0..100 {
            assert_eq!(db.get(format!("synced-{i}").as_bytes()).unwrap(), b"durable");
            assert!(matches!(
                db.get(format!("volatile-{i}").as_bytes()),
                Err(Error::KeyNotFound)
            ));
        }
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_memtable_space_timeout_and_recovery() {
        let dir = TempDir::new().unwrap();
        let options = small_options(&dir).memtable_nums(2).auto_compact(false);
        let db = Db::open(options).unwrap();

        // Starve the flush worker so rotations pile up behind the queue.
        let stall = db.inner.flush_lock.lock().await;

        let mut timed_out = false;
        for i in 0..2000 {
            match db.put(format!("key-{i:05}").as_bytes(), &[0u8; 64]) {
                Ok(()) => {}
                Err(Error::WaitMemtableSpaceTimeout) => {
                    timed_out = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(timed_out, "writes should hit memtable backpressure");

        // Release the worker, let it drain, and retry.
        drop(stall);
        tokio::time::sleep(Duration::from_millis(300)).await;
        db.put(b"after-drain", b"v").unwrap();
        assert_eq!(db.get(b"after-drain").unwrap(), b"v");

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();

        let mut batch = db.new_batch(BatchOptions::default()).unwrap();
        batch.put_with_expiry(b"gone", b"v", now_unix() - 1).unwrap();
        batch.commit().unwrap();
        assert!(matches!(db.get(b"gone"), Err(Error::KeyNotFound)));
        assert!(!db.exist(b"gone").unwrap());

        db.put_with_ttl(b"fresh", b"v", Duration::from_secs(3600)).unwrap();
        assert_eq!(db.get(b"fresh").unwrap(), b"v");

        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_depmeta_persisted_on_close() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir).auto_compact(false)).unwrap();

        for i in 0..50 {
            db.put(format!("key-{i}").as_bytes(), b"v1").unwrap();
        }
        db.flush().await.unwrap();
        for i in 0..50 {
            db.put(format!("key-{i}").as_bytes(), b"v2").unwrap();
        }
        db.flush().await.unwrap();

        let deprecated = db.inner.vlog.deprecated_number();
        let total = db.inner.vlog.total_number();
        assert!(deprecated >= 50);
        db.close().await.unwrap();

        let meta = read_deprecated_meta(&dir.path().join(DEPRECATED_META_NAME)).unwrap();
        assert_eq!(meta, (deprecated, total));

        // Counters flow back into the reopened value log.
        let db = Db::open(test_options(&dir)).unwrap();
        assert_eq!(db.inner.vlog.deprecated_number(), deprecated);
        assert_eq!(db.inner.vlog.total_number(), total);
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_compaction_temp_files_removed_at_open() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("000000001.tvlog.0");
        std::fs::write(&stale, b"leftover").unwrap();

        let db = Db::open(test_options(&dir)).unwrap();
        assert!(!stale.exists());
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rotation_preserves_reads() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(small_options(&dir)).unwrap();

        // Enough data to roll through several memtables.
        for i in 0..300 {
            db.put(format!("key-{i:04}").as_bytes(), &[i as u8; 32]).unwrap();
        }
        for i in 0..300 {
            assert_eq!(
                db.get(format!("key-{i:04}").as_bytes()).unwrap(),
                vec![i as u8; 32]
            );
        }
        db.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_succeeds() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(test_options(&dir)).unwrap();
        db.put(b"k", b"v").unwrap();
        db.sync().unwrap();
        db.close().await.unwrap();
    }
}
