//! Pooled write batches: the only write path into the database.
//!
//! A batch collects pending writes in a map (latest write to a key wins),
//! then commits them atomically: encode WAL entries, wait for memtable
//! space, append to the active memtable's WAL, install into its skip list.
//! Single-key operations on the database are sugar over a one-operation
//! batch drawn from a free-list, so the steady-state write path allocates
//! almost nothing per operation.
//!
//! A writing batch holds the database state lock in write mode from creation
//! to commit, which serializes batches against memtable rotation and flush
//! installation; a read-only batch holds it in read mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::BatchOptions;
use crate::db::{Db, DbState};
use crate::error::{Error, Result};
use crate::memtable::{now_unix, RecordKind, WalEntry};

/// Bound on the free-list so a burst of batches does not pin memory forever.
const MAX_POOLED_BATCHES: usize = 16;

/// Approximate per-entry overhead on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone)]
struct PendingWrite {
    kind: RecordKind,
    value: Vec<u8>,
    expires_at: i64,
}

/// The heap part of a batch, recycled through [`BatchPool`].
#[derive(Default)]
pub(crate) struct BatchCore {
    pending: HashMap<Vec<u8>, PendingWrite>,
}

/// Bounded free-list of batch cores.
pub(crate) struct BatchPool {
    cores: Mutex<Vec<BatchCore>>,
}

impl BatchPool {
    pub fn new() -> Self {
        Self {
            cores: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> BatchCore {
        self.cores
            .lock()
            .map(|mut cores| cores.pop())
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    fn release(&self, mut core: BatchCore) {
        core.pending.clear();
        if let Ok(mut cores) = self.cores.lock() {
            if cores.len() < MAX_POOLED_BATCHES {
                cores.push(core);
            }
        }
    }
}

/// Snowflake-style batch id source: millisecond timestamp in the high bits,
/// a sequence in the low bits, monotonically increasing across calls.
pub(crate) struct BatchIdSource {
    last: AtomicU64,
}

impl BatchIdSource {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            << 16;
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(last.max(now) + 1)
            })
            .expect("id update always succeeds");
        prev.max(now) + 1
    }
}

/// A short-lived group of operations committed atomically.
///
/// Writes become visible to other batches only at [`Batch::commit`]; reads
/// inside the batch observe its own pending writes first. Dropping an
/// uncommitted batch discards its writes.
pub struct Batch<'a> {
    db: &'a Db,
    core: Option<BatchCore>,
    options: BatchOptions,
    batch_id: u64,
    write_guard: Option<RwLockWriteGuard<'a, DbState>>,
    read_guard: Option<RwLockReadGuard<'a, DbState>>,
    committed: bool,
    rolled_back: bool,
}

impl<'a> Batch<'a> {
    pub(crate) fn new(db: &'a Db, options: BatchOptions) -> Result<Self> {
        let inner = db.inner();
        let (write_guard, read_guard, core, batch_id) = if options.read_only {
            let guard = inner.state.read()?;
            if guard.closed {
                return Err(Error::DatabaseClosed);
            }
            (None, Some(guard), None, 0)
        } else {
            let guard = inner.state.write()?;
            if guard.closed {
                return Err(Error::DatabaseClosed);
            }
            (
                Some(guard),
                None,
                Some(inner.batch_pool.acquire()),
                inner.batch_ids.next(),
            )
        };

        Ok(Self {
            db,
            core,
            options,
            batch_id,
            write_guard,
            read_guard,
            committed: false,
            rolled_back: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.committed {
            return Err(Error::BatchCommitted);
        }
        if self.rolled_back {
            return Err(Error::BatchRolledBack);
        }
        Ok(())
    }

    fn check_writable(&self, key: &[u8], value_len: usize) -> Result<()> {
        self.check_open()?;
        if self.options.read_only {
            return Err(Error::ReadOnlyBatch);
        }
        if key.is_empty() {
            return Err(Error::InvalidData("key must not be empty".to_string()));
        }
        let memtable_size = self.db.inner().options.memtable_size as usize;
        if key.len() + value_len + ENTRY_OVERHEAD > memtable_size {
            return Err(Error::ValueTooBig);
        }
        Ok(())
    }

    /// Stages a write of `value` under `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_inner(key, value, 0)
    }

    /// Stages a write that expires at the given unix timestamp (seconds).
    /// Zero means no expiry.
    pub fn put_with_expiry(&mut self, key: &[u8], value: &[u8], expires_at: i64) -> Result<()> {
        self.put_inner(key, value, expires_at)
    }

    fn put_inner(&mut self, key: &[u8], value: &[u8], expires_at: i64) -> Result<()> {
        self.check_writable(key, value.len())?;
        self.core
            .as_mut()
            .expect("write batch has a core")
            .pending
            .insert(
                key.to_vec(),
                PendingWrite {
                    kind: RecordKind::Normal,
                    value: value.to_vec(),
                    expires_at,
                },
            );
        Ok(())
    }

    /// Stages a tombstone for `key`. Deleting an absent key succeeds.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable(key, 0)?;
        self.core
            .as_mut()
            .expect("write batch has a core")
            .pending
            .insert(
                key.to_vec(),
                PendingWrite {
                    kind: RecordKind::Tombstone,
                    value: Vec::new(),
                    expires_at: 0,
                },
            );
        Ok(())
    }

    /// Reads `key`, observing this batch's own pending writes first, then
    /// memtables newest-first, then the index and value log.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        if key.is_empty() {
            return Err(Error::InvalidData("key must not be empty".to_string()));
        }
        match self.get_inner(key)? {
            Some(value) => Ok(value),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Whether `key` currently exists.
    pub fn exist(&self, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        if key.is_empty() {
            return Err(Error::InvalidData("key must not be empty".to_string()));
        }
        Ok(self.get_inner(key)?.is_some())
    }

    fn get_inner(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // Read-your-own-writes inside the transaction.
        if let Some(core) = &self.core {
            if let Some(pending) = core.pending.get(key) {
                if pending.kind == RecordKind::Tombstone {
                    return Ok(None);
                }
                if pending.expires_at > 0 && pending.expires_at <= now_unix() {
                    return Ok(None);
                }
                return Ok(Some(pending.value.clone()));
            }
        }

        let state = self.state();
        match state.active.get(key) {
            Some((true, _)) => return Ok(None),
            Some((false, value)) => return Ok(Some(value)),
            None => {}
        }
        for table in state.immutables.iter().rev() {
            match table.get(key) {
                Some((true, _)) => return Ok(None),
                Some((false, value)) => return Ok(Some(value)),
                None => {}
            }
        }

        self.db.inner().get_from_disk(key)
    }

    /// Commits every pending write: WAL first for durability, then the
    /// active memtable for visibility. The database lock is released on
    /// success; on failure the batch stays open for retry or rollback.
    pub fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        if self.options.read_only {
            self.committed = true;
            self.finish();
            return Ok(());
        }

        if self
            .core
            .as_ref()
            .map_or(true, |core| core.pending.is_empty())
        {
            self.committed = true;
            self.finish();
            return Ok(());
        }

        let batch_id = self.batch_id;
        let entries: Vec<WalEntry> = self
            .core
            .as_mut()
            .expect("write batch has a core")
            .pending
            .drain()
            .map(|(key, pending)| WalEntry {
                batch_id,
                kind: pending.kind,
                expires_at: pending.expires_at,
                key,
                value: pending.value,
            })
            .collect();

        let inner = self.db.inner();
        let state = self
            .write_guard
            .as_deref_mut()
            .expect("write batch holds the write guard");
        // Rotate before any WAL append so a sealed memtable's WAL never
        // receives post-seal records.
        inner.wait_memtable_space(state)?;
        let active = state.active.clone();
        active.put_batch(&entries, self.options.sync, self.options.disable_wal)?;

        self.committed = true;
        self.finish();
        Ok(())
    }

    /// Discards every pending write and releases the database lock.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.rolled_back = true;
        self.finish();
        Ok(())
    }

    fn state(&self) -> &DbState {
        self.write_guard
            .as_deref()
            .or(self.read_guard.as_deref())
            .expect("batch holds a guard")
    }

    fn finish(&mut self) {
        if let Some(core) = self.core.take() {
            self.db.inner().batch_pool.release(core);
        }
        self.write_guard.take();
        self.read_guard.take();
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        // An uncommitted batch aborts: pending writes are discarded and the
        // lock released.
        if !self.committed && !self.rolled_back {
            self.finish();
        }
    }
}
