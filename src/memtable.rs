//! Memtable: an in-memory ordered map paired with a write-ahead log.
//!
//! New writes always land in the active memtable, and reads consult
//! memtables before the index and value log because their data is newer.
//! Once a memtable reaches its size threshold it is sealed, replaced by a
//! fresh one, and drained to the value log and index by the background
//! flush; after a successful flush its WAL directory is deleted.
//!
//! The map is a `crossbeam_skiplist::SkipMap`, so concurrent readers never
//! block and writers only serialize on the WAL append. The value slot keeps
//! a one-byte kind tag and the expiration alongside the bytes:
//!
//! ```text
//! +--------+--------------------+---------+
//! |kind:u8 | expires_at varint  | value   |
//! +--------+--------------------+---------+
//! ```
//!
//! The slot has no value-length prefix; the slot's own length delimits it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_skiplist::SkipMap;

use crate::config::Options;
use crate::encoding::{read_uvarint, read_varint, write_uvarint, write_varint};
use crate::error::{Error, Result};
use crate::wal::{Wal, WalOptions};

/// Arena slack reserved so a worst-case entry always fits after `is_full`
/// reports false.
const PADDED_SIZE: usize = 64;

const WAL_EXT: &str = ".wal";

/// Kind tag carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Normal = 0,
    Tombstone = 1,
}

impl TryFrom<u8> for RecordKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(RecordKind::Normal),
            1 => Ok(RecordKind::Tombstone),
            other => Err(Error::InvalidData(format!("unknown record kind {other}"))),
        }
    }
}

/// Seconds since the unix epoch.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One entry as encoded into a memtable WAL chunk:
///
/// ```text
/// +------------+--------+-------------------+----------------+-----+-------+
/// |batch_id:u64| kind:u8| expires_at varint | key_len varint | key | value |
/// +------------+--------+-------------------+----------------+-----+-------+
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub batch_id: u64,
    pub kind: RecordKind,
    pub expires_at: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl WalEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.key.len() + self.value.len());
        buf.write_u64::<BigEndian>(self.batch_id).expect("vec write");
        buf.push(self.kind as u8);
        write_varint(&mut buf, self.expires_at);
        write_uvarint(&mut buf, self.key.len() as u64);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buf);
        let batch_id = cursor.read_u64::<BigEndian>().map_err(|_| {
            Error::InvalidData("wal entry shorter than batch id".to_string())
        })?;
        let kind = RecordKind::try_from(cursor.read_u8().map_err(|_| {
            Error::InvalidData("wal entry missing kind tag".to_string())
        })?)?;
        let mut pos = cursor.position() as usize;
        let expires_at = read_varint(buf, &mut pos)?;
        let key_len = read_uvarint(buf, &mut pos)? as usize;
        if pos + key_len > buf.len() {
            return Err(Error::InvalidData("wal entry key overruns chunk".to_string()));
        }
        let key = buf[pos..pos + key_len].to_vec();
        let value = buf[pos + key_len..].to_vec();
        Ok(Self {
            batch_id,
            kind,
            expires_at,
            key,
            value,
        })
    }
}

/// The in-memory value slot stored in the skip list.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MemValue {
    pub kind: RecordKind,
    pub expires_at: i64,
    pub value: Vec<u8>,
}

impl MemValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(11 + self.value.len());
        buf.push(self.kind as u8);
        write_varint(&mut buf, self.expires_at);
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::InvalidData("empty memtable value slot".to_string()));
        }
        let kind = RecordKind::try_from(buf[0])?;
        let mut pos = 1;
        let expires_at = read_varint(buf, &mut pos)?;
        Ok(Self {
            kind,
            expires_at,
            value: buf[pos..].to_vec(),
        })
    }
}

/// Per-entry write knobs used on the memtable path.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryOptions {
    pub sync: bool,
    pub disable_wal: bool,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct MemtableOptions {
    pub dir_path: PathBuf,
    pub table_id: u32,
    pub memtable_size: u32,
    /// Fsync the WAL on every append.
    pub wal_sync: bool,
}

impl MemtableOptions {
    pub fn new(options: &Options) -> Self {
        Self {
            dir_path: options.dir_path.clone(),
            table_id: 1,
            memtable_size: options.memtable_size,
            wal_sync: false,
        }
    }

    fn wal_dir(&self) -> PathBuf {
        self.dir_path.join(format!("{:09}", self.table_id))
    }
}

/// In-memory ordered map plus its dedicated WAL directory.
pub(crate) struct Memtable {
    skl: SkipMap<Vec<u8>, Vec<u8>>,
    wal: Wal,
    size: AtomicUsize,
    opts: MemtableOptions,
}

impl Memtable {
    /// Opens the memtable's WAL directory and rebuilds the skip list by
    /// replaying it. WAL order equals logical write order, so replay leaves
    /// the newest version of every key in place.
    pub fn open(opts: MemtableOptions) -> Result<Self> {
        let wal = Wal::open(WalOptions {
            dir_path: opts.wal_dir(),
            segment_ext: WAL_EXT.to_string(),
            segment_size: u64::from(opts.memtable_size),
            sync: opts.wal_sync,
            block_cache: 0,
        })?;

        let table = Self {
            skl: SkipMap::new(),
            wal,
            size: AtomicUsize::new(0),
            opts,
        };

        for chunk in table.wal.reader()? {
            let (payload, _) = chunk?;
            let entry = match WalEntry::decode(&payload) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(
                        table_id = table.opts.table_id,
                        error = %e,
                        "skipping undecodable wal entry during rebuild"
                    );
                    continue;
                }
            };
            table.install(entry.key, entry.value, entry.kind, entry.expires_at);
        }
        Ok(table)
    }

    /// Appends the entry to the WAL (unless disabled), then installs it in
    /// the skip list. WAL failures leave the in-memory state untouched.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, deleted: bool, opts: EntryOptions) -> Result<()> {
        let kind = if deleted {
            RecordKind::Tombstone
        } else {
            RecordKind::Normal
        };
        let entry = WalEntry {
            batch_id: 0,
            kind,
            expires_at: opts.expires_at,
            key,
            value,
        };
        self.put_batch(std::slice::from_ref(&entry), opts.sync, opts.disable_wal)?;
        Ok(())
    }

    /// Batch variant used by commit: all WAL appends happen before any
    /// skip-list install, and a requested fsync covers the whole batch.
    pub fn put_batch(&self, entries: &[WalEntry], sync: bool, disable_wal: bool) -> Result<()> {
        if !disable_wal {
            for entry in entries {
                self.wal.write(&entry.encode())?;
            }
            if sync && !self.opts.wal_sync {
                self.wal.sync()?;
            }
        }
        for entry in entries {
            self.install(
                entry.key.clone(),
                entry.value.clone(),
                entry.kind,
                entry.expires_at,
            );
        }
        Ok(())
    }

    fn install(&self, key: Vec<u8>, value: Vec<u8>, kind: RecordKind, expires_at: i64) {
        let slot = MemValue {
            kind,
            expires_at,
            value,
        }
        .encode();
        self.size.fetch_add(key.len() + slot.len(), Ordering::SeqCst);
        self.skl.insert(key, slot);
    }

    /// Looks the key up in the skip list.
    ///
    /// Returns `None` when the key is absent, `Some((true, _))` when it is
    /// tombstoned or expired, and `Some((false, value))` otherwise.
    pub fn get(&self, key: &[u8]) -> Option<(bool, Vec<u8>)> {
        let entry = self.skl.get(key)?;
        let mv = match MemValue::decode(entry.value()) {
            Ok(mv) => mv,
            Err(e) => {
                tracing::error!(error = %e, "corrupt memtable value slot");
                return None;
            }
        };
        if mv.kind == RecordKind::Tombstone {
            return Some((true, Vec::new()));
        }
        if mv.expires_at > 0 && mv.expires_at <= now_unix() {
            return Some((true, Vec::new()));
        }
        Some((false, mv.value))
    }

    /// A delete is a put of a tombstone.
    pub fn delete(&self, key: Vec<u8>, opts: EntryOptions) -> Result<()> {
        self.put(key, Vec::new(), true, opts)
    }

    /// Ascending iteration over `(key, slot)` pairs for the flush path.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, MemValue)> + '_ {
        self.skl.iter().filter_map(|entry| {
            match MemValue::decode(entry.value()) {
                Ok(mv) => Some((entry.key().clone(), mv)),
                Err(e) => {
                    tracing::error!(error = %e, "corrupt memtable value slot during scan");
                    None
                }
            }
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    /// Whether the arena lacks space for one more worst-case entry.
    pub fn is_full(&self) -> bool {
        self.size.load(Ordering::SeqCst) + PADDED_SIZE >= self.opts.memtable_size as usize
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.skl.is_empty()
    }

    pub fn table_id(&self) -> u32 {
        self.opts.table_id
    }

    pub fn close(&self) -> Result<()> {
        self.wal.close()
    }

    /// Removes the WAL directory; called after the memtable's contents are
    /// durable in the value log and index.
    pub fn delete_wal(&self) -> Result<()> {
        self.wal.delete()?;
        let dir = self.opts.wal_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("table_id", &self.opts.table_id)
            .field("size", &self.size())
            .finish()
    }
}

/// Discovers existing memtable WAL directories under the database root and
/// reopens them in table-id order; creates the first memtable if none exist.
/// The returned vector is oldest-first and the caller treats the last entry
/// as the active memtable.
pub(crate) fn open_all_memtables(options: &Options) -> Result<Vec<Memtable>> {
    let mut table_ids = Vec::new();
    for entry in std::fs::read_dir(&options.dir_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.len() == 9 && name.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(id) = name.parse::<u32>() {
                    table_ids.push(id);
                }
            }
        }
    }
    table_ids.sort_unstable();
    if table_ids.is_empty() {
        table_ids.push(1);
    }

    let mut tables = Vec::with_capacity(table_ids.len());
    for id in table_ids {
        let opts = MemtableOptions {
            table_id: id,
            ..MemtableOptions::new(options)
        };
        tables.push(Memtable::open(opts)?);
    }
    Ok(tables)
}
