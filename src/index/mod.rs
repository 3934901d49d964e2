//! Partitioned persistent index from key bytes to value-log positions.
//!
//! Two backends share one shape: every partition keeps an in-memory map for
//! lookups plus an append-only edit log for durability, replayed at open.
//! Batched mutations append their edits and update the map under one
//! partition lock, so a batch is atomic per partition.
//!
//! The ordered backend stores exact key bytes. The hash backend stores only
//! the key's hash, so key equality is imprecise there and callers supply
//! match-key callbacks that resolve a candidate slot by reading its
//! value-log record; the flush and compaction paths branch on the backend
//! tag only to decide whether to synthesize those callbacks.

mod btree;
mod hash;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{IndexType, KeyHashFn};
use crate::error::Result;
use crate::vlog::KeyPosition;
use crate::wal::ChunkPosition;

pub(crate) use btree::BTreeIndex;
pub(crate) use hash::HashIndex;

/// Segment size for index edit logs.
const INDEX_LOG_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// What the index stores per key: the partition, the owning record's UID,
/// and the chunk position inside that partition's value log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexedPosition {
    pub partition: u32,
    pub uid: Uuid,
    pub position: ChunkPosition,
}

impl IndexedPosition {
    pub fn into_key_position(self, key: Vec<u8>) -> KeyPosition {
        KeyPosition {
            key,
            partition: self.partition,
            uid: self.uid,
            position: self.position,
        }
    }
}

/// Resolves whether a candidate slot belongs to the key being looked up,
/// typically by reading the slot's value-log record and comparing keys.
pub(crate) type MatchKeyFn<'a> = Box<dyn Fn(&IndexedPosition) -> Result<bool> + Send + Sync + 'a>;

#[derive(Clone)]
pub(crate) struct IndexOptions {
    pub index_type: IndexType,
    pub dir_path: PathBuf,
    pub partition_num: u32,
    pub key_hash_function: KeyHashFn,
}

impl IndexOptions {
    pub fn partition_of(&self, key: &[u8]) -> u32 {
        ((self.key_hash_function)(key) % u64::from(self.partition_num)) as u32
    }
}

/// Tagged variant over the index backends.
pub(crate) enum Index {
    BTree(BTreeIndex),
    Hash(HashIndex),
}

pub(crate) fn open_index(opts: IndexOptions) -> Result<Index> {
    match opts.index_type {
        IndexType::BTree => Ok(Index::BTree(BTreeIndex::open(opts)?)),
        IndexType::Hash => Ok(Index::Hash(HashIndex::open(opts)?)),
    }
}

impl Index {
    /// Installs the positions, returning the previous position of every key
    /// that already existed. `match_keys`, when given, is parallel to
    /// `positions` and only consulted by the hash backend.
    pub fn put_batch(
        &self,
        positions: &[KeyPosition],
        match_keys: Option<&[MatchKeyFn<'_>]>,
    ) -> Result<Vec<KeyPosition>> {
        match self {
            Index::BTree(index) => index.put_batch(positions),
            Index::Hash(index) => index.put_batch(positions, match_keys),
        }
    }

    /// Removes the keys, returning the previous positions that were removed.
    pub fn delete_batch(
        &self,
        keys: &[Vec<u8>],
        match_keys: Option<&[MatchKeyFn<'_>]>,
    ) -> Result<Vec<KeyPosition>> {
        match self {
            Index::BTree(index) => index.delete_batch(keys),
            Index::Hash(index) => index.delete_batch(keys, match_keys),
        }
    }

    /// Looks one key up.
    pub fn get(&self, key: &[u8], match_key: Option<&MatchKeyFn<'_>>) -> Result<Option<KeyPosition>> {
        match self {
            Index::BTree(index) => index.get(key),
            Index::Hash(index) => index.get(key, match_key),
        }
    }

    /// Whether this backend needs match-key callbacks to resolve equality.
    pub fn needs_match_keys(&self) -> bool {
        matches!(self, Index::Hash(_))
    }

    pub fn sync(&self) -> Result<()> {
        match self {
            Index::BTree(index) => index.sync(),
            Index::Hash(index) => index.sync(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Index::BTree(index) => index.close(),
            Index::Hash(index) => index.close(),
        }
    }
}
