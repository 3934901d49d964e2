//! Partitioned value log with deprecated-record bookkeeping.
//!
//! Values live outside the index: every flushed record is appended to one of
//! `P` independent segmented logs, chosen by key hash, and the index stores
//! only the resulting chunk position. Each partition carries a deprecated
//! set of record UIDs known to be superseded or deleted; the compactor uses
//! those sets, together with index verification, to decide which records a
//! partition rewrite may drop.
//!
//! Record payload inside each chunk:
//!
//! ```text
//! +---------+----------------+-----+-------+
//! |uid:16B  | key_len varint | key | value |
//! +---------+----------------+-----+-------+
//! ```
//!
//! The value length is implied by the chunk length minus the header.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use uuid::Uuid;

use crate::config::KeyHashFn;
use crate::encoding::{read_uvarint, write_uvarint};
use crate::error::{Error, Result};
use crate::wal::{ChunkPosition, Wal, WalOptions};

/// Extension for a live value-log partition file.
pub(crate) fn value_log_ext(partition: u32) -> String {
    format!(".vlog.{partition}")
}

/// Extension for a compaction rewrite target.
pub(crate) fn temp_value_log_ext(partition: u32) -> String {
    format!(".tvlog.{partition}")
}

/// One record stored in the value log.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValueLogRecord {
    pub uid: Uuid,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl ValueLogRecord {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            // Time-ordered and unique within the process; never reused, so
            // the compactor can reason about obsolescence without comparing
            // payloads.
            uid: Uuid::now_v7(),
            key,
            value,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.key.len() + self.value.len());
        buf.extend_from_slice(self.uid.as_bytes());
        write_uvarint(&mut buf, self.key.len() as u64);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::InvalidData(
                "value log record shorter than uid".to_string(),
            ));
        }
        let uid = Uuid::from_slice(&buf[..16])
            .map_err(|e| Error::InvalidData(format!("bad record uid: {e}")))?;
        let mut pos = 16;
        let key_len = read_uvarint(buf, &mut pos)? as usize;
        if pos + key_len > buf.len() {
            return Err(Error::InvalidData(
                "value log record key overruns chunk".to_string(),
            ));
        }
        let key = buf[pos..pos + key_len].to_vec();
        let value = buf[pos + key_len..].to_vec();
        Ok(Self { uid, key, value })
    }
}

/// Where a key's live record resides: partition, chunk position, and the
/// record's UID.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyPosition {
    pub key: Vec<u8>,
    pub partition: u32,
    pub uid: Uuid,
    pub position: ChunkPosition,
}

/// Per-partition set of record UIDs known to be obsolete but not yet
/// physically reclaimed.
pub(crate) struct DeprecatedTable {
    table: RwLock<HashSet<Uuid>>,
}

impl DeprecatedTable {
    fn new() -> Self {
        Self {
            table: RwLock::new(HashSet::new()),
        }
    }

    fn insert(&self, uid: Uuid) -> bool {
        self.table.write().expect("deprecated table lock").insert(uid)
    }

    fn contains(&self, uid: &Uuid) -> bool {
        self.table.read().expect("deprecated table lock").contains(uid)
    }

    fn clean(&self) -> usize {
        let mut table = self.table.write().expect("deprecated table lock");
        let drained = table.len();
        table.clear();
        drained
    }
}

#[derive(Clone)]
pub(crate) struct ValueLogOptions {
    pub dir_path: PathBuf,
    pub segment_size: u64,
    pub block_cache: usize,
    pub partition_num: u32,
    pub key_hash_function: KeyHashFn,
    /// Counter snapshots recovered from the DEPMETA file.
    pub deprecated_number: u32,
    pub total_number: u32,
}

/// `P` independent append-only partitions plus their deprecated sets.
pub(crate) struct ValueLog {
    partitions: Vec<RwLock<Wal>>,
    dp_tables: Vec<DeprecatedTable>,
    deprecated_number: AtomicU32,
    total_number: AtomicU32,
    opts: ValueLogOptions,
}

impl ValueLog {
    pub fn open(opts: ValueLogOptions) -> Result<Self> {
        let mut partitions = Vec::with_capacity(opts.partition_num as usize);
        let mut dp_tables = Vec::with_capacity(opts.partition_num as usize);
        for p in 0..opts.partition_num {
            partitions.push(RwLock::new(Wal::open(WalOptions {
                dir_path: opts.dir_path.clone(),
                segment_ext: value_log_ext(p),
                segment_size: opts.segment_size,
                sync: false, // synced explicitly by flush and compaction
                block_cache: opts.block_cache,
            })?));
            dp_tables.push(DeprecatedTable::new());
        }
        Ok(Self {
            partitions,
            dp_tables,
            deprecated_number: AtomicU32::new(opts.deprecated_number),
            total_number: AtomicU32::new(opts.total_number),
            opts,
        })
    }

    pub fn partition_num(&self) -> u32 {
        self.opts.partition_num
    }

    /// Partition a key belongs to.
    pub fn partition_of(&self, key: &[u8]) -> u32 {
        ((self.opts.key_hash_function)(key) % u64::from(self.opts.partition_num)) as u32
    }

    /// Appends every record to its partition and returns chunk positions in
    /// input order.
    pub fn write_batch(&self, records: &[ValueLogRecord]) -> Result<Vec<KeyPosition>> {
        let mut per_partition: Vec<Vec<usize>> =
            vec![Vec::new(); self.opts.partition_num as usize];
        for (i, record) in records.iter().enumerate() {
            per_partition[self.partition_of(&record.key) as usize].push(i);
        }

        let mut positions: Vec<Option<KeyPosition>> = vec![None; records.len()];
        for (p, indexes) in per_partition.iter().enumerate() {
            if indexes.is_empty() {
                continue;
            }
            let wal = self.partitions[p].read()?;
            for &i in indexes {
                wal.pending_writes(records[i].encode());
            }
            let chunk_positions = wal.write_all()?;
            for (&i, position) in indexes.iter().zip(chunk_positions) {
                positions[i] = Some(KeyPosition {
                    key: records[i].key.clone(),
                    partition: p as u32,
                    uid: records[i].uid,
                    position,
                });
            }
        }

        self.total_number
            .fetch_add(records.len() as u32, Ordering::SeqCst);
        Ok(positions.into_iter().map(|p| p.expect("position assigned")).collect())
    }

    /// Random read of one record.
    pub fn read(&self, partition: u32, position: ChunkPosition) -> Result<ValueLogRecord> {
        let chunk = self.partitions[partition as usize].read()?.read(position)?;
        ValueLogRecord::decode(&chunk)
    }

    /// Fsyncs every partition.
    pub fn sync(&self) -> Result<()> {
        for partition in &self.partitions {
            partition.read()?.sync()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        for partition in &self.partitions {
            partition.read()?.close()?;
        }
        Ok(())
    }

    /// Marks a record obsolete; its bytes are reclaimed by the next
    /// compaction of its partition.
    pub fn set_deprecated(&self, partition: u32, uid: Uuid) {
        if self.dp_tables[partition as usize].insert(uid) {
            self.deprecated_number.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_deprecated(&self, partition: u32, uid: &Uuid) -> bool {
        self.dp_tables[partition as usize].contains(uid)
    }

    /// Empties every deprecated set after a compaction and folds the
    /// reclaimed records out of the totals.
    pub fn clean_deprecated_table(&self) {
        let mut drained = 0u32;
        for table in &self.dp_tables {
            drained += table.clean() as u32;
        }
        self.deprecated_number.store(0, Ordering::SeqCst);
        let _ = self
            .total_number
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                Some(total.saturating_sub(drained))
            });
    }

    /// Clears one partition's deprecated set without touching the global
    /// counters; used by the full-scan compaction which settles counters for
    /// all partitions at once.
    pub fn clean_partition_deprecated(&self, partition: u32) {
        self.dp_tables[partition as usize].clean();
    }

    pub fn deprecated_number(&self) -> u32 {
        self.deprecated_number.load(Ordering::SeqCst)
    }

    pub fn total_number(&self) -> u32 {
        self.total_number.load(Ordering::SeqCst)
    }

    /// Opens a fresh segmented log for `partition` under the given
    /// extension; used by compaction for its rewrite target and for the
    /// post-rename reopen.
    pub fn open_partition_file(&self, partition: u32, ext: String) -> Result<Wal> {
        Wal::open(WalOptions {
            dir_path: self.opts.dir_path.clone(),
            segment_ext: ext,
            segment_size: self.opts.segment_size,
            sync: false,
            block_cache: self.opts.block_cache,
        })
    }

    /// Runs `f` with exclusive access to one partition's log, blocking that
    /// partition's readers for the duration. The compactor rewrites and
    /// swaps a partition under this lock so no reader ever follows an index
    /// position into a half-built file.
    pub fn with_partition_mut<T>(
        &self,
        partition: u32,
        f: impl FnOnce(&mut Wal) -> Result<T>,
    ) -> Result<T> {
        let mut wal = self.partitions[partition as usize].write()?;
        f(&mut wal)
    }
}
