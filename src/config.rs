use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Hash function used to assign keys to index and value-log partitions.
pub type KeyHashFn = fn(&[u8]) -> u64;

/// Default partition hash: xxHash64 over the raw key bytes.
pub fn default_key_hash(key: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(key, 0)
}

/// Which index backend stores key positions on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// Ordered index with exact key bytes. Match-key callbacks are unused.
    BTree,
    /// Hash-keyed index. Key equality is imprecise and must be resolved by
    /// the caller through match-key callbacks.
    Hash,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding all database files. Required.
    pub dir_path: PathBuf,

    /// Maximum size of a memtable before it is sealed and queued for flush
    /// (default: 64MB)
    pub memtable_size: u32,

    /// Maximum number of memtables resident in memory, active included
    /// (default: 15)
    pub memtable_nums: usize,

    /// Number of partitions for the index and the value log (default: 3)
    pub partition_num: usize,

    /// Maximum size of a single value-log segment file. Clamped to at least
    /// `memtable_size` at open (default: 1GB)
    pub value_log_file_size: u64,

    /// Capacity of the value-log chunk cache in entries; 0 disables caching
    /// (default: 0)
    pub block_cache: usize,

    /// Index backend (default: BTree)
    pub index_type: IndexType,

    /// Hash function for partition selection (default: xxHash64)
    pub key_hash_function: KeyHashFn,

    /// How many records a compaction rewrites per index round-trip
    /// (default: 10000)
    pub compact_batch_count: usize,

    /// How long a write waits for the flush pipeline to free memtable space
    /// before failing (default: 100ms)
    pub wait_mem_space_timeout: Duration,

    /// Whether flushes evaluate deprecated-table thresholds and signal the
    /// background compactor (default: true)
    pub auto_compact: bool,

    /// Fraction of total value-log records that must be deprecated before an
    /// opportunistic (disk-idle) compaction is signaled (default: 0.3)
    pub deprecated_table_lower_rate: f32,

    /// Fraction of total value-log records that must be deprecated before a
    /// mandatory compaction is signaled (default: 0.5)
    pub deprecated_table_upper_rate: f32,

    /// Disk utilization sampling interval (default: 100ms)
    pub disk_io_sampling_interval: Duration,

    /// Utilization fraction above which the disk counts as busy
    /// (default: 0.5)
    pub disk_io_busy_rate: f32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir_path: PathBuf::new(),
            memtable_size: 64 * 1024 * 1024, // 64MB
            memtable_nums: 15,
            partition_num: 3,
            value_log_file_size: 1024 * 1024 * 1024, // 1GB
            block_cache: 0,
            index_type: IndexType::BTree,
            key_hash_function: default_key_hash,
            compact_batch_count: 10_000,
            wait_mem_space_timeout: Duration::from_millis(100),
            auto_compact: true,
            deprecated_table_lower_rate: 0.3,
            deprecated_table_upper_rate: 0.5,
            disk_io_sampling_interval: Duration::from_millis(100),
            disk_io_busy_rate: 0.5,
        }
    }
}

impl Options {
    /// Create options with the given directory and defaults for the rest.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir_path: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum memtable size in bytes.
    pub fn memtable_size(mut self, size: u32) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the maximum number of resident memtables.
    pub fn memtable_nums(mut self, nums: usize) -> Self {
        self.memtable_nums = nums;
        self
    }

    /// Set the number of index/value-log partitions.
    pub fn partition_num(mut self, num: usize) -> Self {
        self.partition_num = num;
        self
    }

    /// Set the maximum value-log segment size in bytes.
    pub fn value_log_file_size(mut self, size: u64) -> Self {
        self.value_log_file_size = size;
        self
    }

    /// Set the chunk cache capacity in entries.
    pub fn block_cache(mut self, entries: usize) -> Self {
        self.block_cache = entries;
        self
    }

    /// Set the index backend.
    pub fn index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    /// Set the partition hash function.
    pub fn key_hash_function(mut self, f: KeyHashFn) -> Self {
        self.key_hash_function = f;
        self
    }

    /// Set the compaction rewrite batch size.
    pub fn compact_batch_count(mut self, count: usize) -> Self {
        self.compact_batch_count = count;
        self
    }

    /// Set the memtable-space wait timeout.
    pub fn wait_mem_space_timeout(mut self, timeout: Duration) -> Self {
        self.wait_mem_space_timeout = timeout;
        self
    }

    /// Enable or disable automatic compaction.
    pub fn auto_compact(mut self, enabled: bool) -> Self {
        self.auto_compact = enabled;
        self
    }

    /// Set the lower deprecated-table threshold rate.
    pub fn deprecated_table_lower_rate(mut self, rate: f32) -> Self {
        self.deprecated_table_lower_rate = rate;
        self
    }

    /// Set the upper deprecated-table threshold rate.
    pub fn deprecated_table_upper_rate(mut self, rate: f32) -> Self {
        self.deprecated_table_upper_rate = rate;
        self
    }

    /// Validates the options and normalizes degenerate values, mirroring the
    /// clamping applied at open: partition and memtable counts are floored at
    /// one (two memtables minimum, one active plus one in flight), and a
    /// value-log segment must be able to absorb at least one full memtable.
    pub(crate) fn validate(&mut self) -> Result<()> {
        if self.dir_path.as_os_str().is_empty() {
            return Err(Error::DirectoryIsEmpty);
        }
        if self.memtable_size == 0 {
            self.memtable_size = Options::default().memtable_size;
        }
        if self.memtable_nums < 2 {
            self.memtable_nums = 2;
        }
        if self.partition_num == 0 {
            self.partition_num = 1;
        }
        if self.value_log_file_size < u64::from(self.memtable_size) {
            self.value_log_file_size = u64::from(self.memtable_size);
        }
        if self.compact_batch_count == 0 {
            self.compact_batch_count = Options::default().compact_batch_count;
        }
        Ok(())
    }
}

/// Per-write durability knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Fsync the memtable WAL after the write.
    pub sync: bool,
    /// Skip the WAL entirely. The write is lost on crash until flushed.
    pub disable_wal: bool,
}

/// Options for an explicitly created batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Fsync the memtable WAL after the commit.
    pub sync: bool,
    /// Skip the WAL for every write in the batch.
    pub disable_wal: bool,
    /// The batch only reads; it takes the database lock in shared mode.
    pub read_only: bool,
}
