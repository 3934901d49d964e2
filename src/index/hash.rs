//! Hash index backend: key hashes mapped to position slots.
//!
//! Only the 64-bit key hash is stored, never the key bytes, so two keys can
//! share a bucket and a lookup cannot tell their slots apart on its own.
//! Callers that need exactness (flush, compaction) pass a match-key callback
//! which reads a candidate slot's value-log record and compares keys; a
//! lookup without a callback settles for the first slot in the bucket.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{IndexOptions, IndexedPosition, MatchKeyFn, INDEX_LOG_SEGMENT_SIZE};
use crate::error::Result;
use crate::vlog::KeyPosition;
use crate::wal::{Wal, WalOptions};

fn hash_log_ext(partition: u32) -> String {
    format!(".hindex.{partition}")
}

/// One durable mutation of a partition's buckets. `replaced` carries the
/// UID the put superseded so replay can reproduce in-place supersession
/// without knowing keys.
#[derive(Debug, Serialize, Deserialize)]
enum Edit {
    Put {
        hash: u64,
        slot: IndexedPosition,
        replaced: Option<Uuid>,
    },
    Delete {
        hash: u64,
        uid: Uuid,
    },
}

struct Partition {
    buckets: HashMap<u64, Vec<IndexedPosition>>,
    log: Wal,
}

impl Partition {
    fn open(opts: &IndexOptions, partition: u32) -> Result<Self> {
        let log = Wal::open(WalOptions {
            dir_path: opts.dir_path.clone(),
            segment_ext: hash_log_ext(partition),
            segment_size: INDEX_LOG_SEGMENT_SIZE,
            sync: false,
            block_cache: 0,
        })?;

        let mut buckets: HashMap<u64, Vec<IndexedPosition>> = HashMap::new();
        for chunk in log.reader()? {
            let (payload, _) = chunk?;
            match bincode::deserialize::<Edit>(&payload)? {
                Edit::Put {
                    hash,
                    slot,
                    replaced,
                } => {
                    let bucket = buckets.entry(hash).or_default();
                    if let Some(old_uid) = replaced {
                        bucket.retain(|s| s.uid != old_uid);
                    }
                    bucket.push(slot);
                }
                Edit::Delete { hash, uid } => {
                    if let Some(bucket) = buckets.get_mut(&hash) {
                        bucket.retain(|s| s.uid != uid);
                        if bucket.is_empty() {
                            buckets.remove(&hash);
                        }
                    }
                }
            }
        }
        Ok(Self { buckets, log })
    }

    /// Picks the slot in `hash`'s bucket that belongs to the caller's key.
    fn locate(
        &self,
        hash: u64,
        match_key: Option<&MatchKeyFn<'_>>,
    ) -> Result<Option<usize>> {
        let bucket = match self.buckets.get(&hash) {
            Some(bucket) if !bucket.is_empty() => bucket,
            _ => return Ok(None),
        };
        match match_key {
            Some(matches) => {
                for (i, slot) in bucket.iter().enumerate() {
                    if matches(slot)? {
                        return Ok(Some(i));
                    }
                }
                Ok(None)
            }
            None => Ok(Some(0)),
        }
    }
}

/// Partitioned hash index; each partition is a bucket map replayed from its
/// edit log.
pub(crate) struct HashIndex {
    partitions: Vec<Mutex<Partition>>,
    opts: IndexOptions,
}

impl HashIndex {
    pub fn open(opts: IndexOptions) -> Result<Self> {
        let mut partitions = Vec::with_capacity(opts.partition_num as usize);
        for p in 0..opts.partition_num {
            partitions.push(Mutex::new(Partition::open(&opts, p)?));
        }
        Ok(Self { partitions, opts })
    }

    fn hash(&self, key: &[u8]) -> u64 {
        (self.opts.key_hash_function)(key)
    }

    pub fn put_batch(
        &self,
        positions: &[KeyPosition],
        match_keys: Option<&[MatchKeyFn<'_>]>,
    ) -> Result<Vec<KeyPosition>> {
        let mut previous = Vec::new();
        for (i, pos) in positions.iter().enumerate() {
            let match_key = match_keys.and_then(|fns| fns.get(i));
            let hash = self.hash(&pos.key);
            let mut partition = self.partitions[pos.partition as usize].lock()?;

            let replaced = match partition.locate(hash, match_key)? {
                Some(slot_idx) => {
                    let bucket = partition.buckets.get_mut(&hash).expect("bucket located");
                    let old = bucket.remove(slot_idx);
                    previous.push(old.into_key_position(pos.key.clone()));
                    Some(old.uid)
                }
                None => None,
            };

            let slot = IndexedPosition {
                partition: pos.partition,
                uid: pos.uid,
                position: pos.position,
            };
            partition.buckets.entry(hash).or_default().push(slot);
            let edit = Edit::Put {
                hash,
                slot,
                replaced,
            };
            partition.log.pending_writes(bincode::serialize(&edit)?);
            partition.log.write_all()?;
        }
        Ok(previous)
    }

    pub fn delete_batch(
        &self,
        keys: &[Vec<u8>],
        match_keys: Option<&[MatchKeyFn<'_>]>,
    ) -> Result<Vec<KeyPosition>> {
        let mut previous = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let match_key = match_keys.and_then(|fns| fns.get(i));
            let hash = self.hash(key);
            let partition_id = self.opts.partition_of(key);
            let mut partition = self.partitions[partition_id as usize].lock()?;

            if let Some(slot_idx) = partition.locate(hash, match_key)? {
                let bucket = partition.buckets.get_mut(&hash).expect("bucket located");
                let old = bucket.remove(slot_idx);
                if bucket.is_empty() {
                    partition.buckets.remove(&hash);
                }
                let edit = Edit::Delete {
                    hash,
                    uid: old.uid,
                };
                partition.log.pending_writes(bincode::serialize(&edit)?);
                partition.log.write_all()?;
                previous.push(old.into_key_position(key.clone()));
            }
        }
        Ok(previous)
    }

    pub fn get(
        &self,
        key: &[u8],
        match_key: Option<&MatchKeyFn<'_>>,
    ) -> Result<Option<KeyPosition>> {
        let hash = self.hash(key);
        // Snapshot the bucket and run match callbacks outside the partition
        // lock. The callbacks read the value log, and a concurrent
        // compaction holds a value-log partition exclusively while taking
        // index locks to re-point entries; a reader holding an index lock
        // across a value-log read would close that cycle.
        let candidates: Vec<IndexedPosition> = {
            let partition = self.partitions[self.opts.partition_of(key) as usize].lock()?;
            partition.buckets.get(&hash).cloned().unwrap_or_default()
        };
        match match_key {
            Some(matches) => {
                for slot in &candidates {
                    if matches(slot)? {
                        return Ok(Some(slot.into_key_position(key.to_vec())));
                    }
                }
                Ok(None)
            }
            None => Ok(candidates
                .first()
                .map(|slot| slot.into_key_position(key.to_vec()))),
        }
    }

    pub fn sync(&self) -> Result<()> {
        for partition in &self.partitions {
            partition.lock()?.log.sync()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_key_hash, IndexType};
    use crate::wal::ChunkPosition;
    use tempfile::TempDir;

    /// Hash function with a single bucket, so every key collides.
    fn colliding_hash(_key: &[u8]) -> u64 {
        7
    }

    fn test_index(dir: &TempDir, hash_fn: crate::config::KeyHashFn) -> HashIndex {
        HashIndex::open(IndexOptions {
            index_type: IndexType::Hash,
            dir_path: dir.path().to_path_buf(),
            partition_num: 2,
            key_hash_function: hash_fn,
        })
        .unwrap()
    }

    fn position(index: &HashIndex, key: &[u8], offset: u64) -> KeyPosition {
        KeyPosition {
            key: key.to_vec(),
            partition: index.opts.partition_of(key),
            uid: Uuid::now_v7(),
            position: ChunkPosition {
                segment_id: 1,
                offset,
            },
        }
    }

    /// Match fn that resolves slots by uid, standing in for the value-log
    /// read the database performs.
    fn match_uid(uid: Uuid) -> MatchKeyFn<'static> {
        Box::new(move |slot: &IndexedPosition| Ok(slot.uid == uid))
    }

    #[test]
    fn test_put_get_without_collisions() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir, default_key_hash);

        let pos = position(&index, b"key", 8);
        index.put_batch(std::slice::from_ref(&pos), None).unwrap();

        let found = index.get(b"key", None).unwrap().unwrap();
        assert_eq!(found.uid, pos.uid);
        assert!(index.get(b"other", None).unwrap().is_none());
    }

    #[test]
    fn test_colliding_keys_need_match_fns() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir, colliding_hash);

        let a = position(&index, b"aaa", 8);
        let b = position(&index, b"bbb", 80);
        index.put_batch(std::slice::from_ref(&a), None).unwrap();
        // Without a match fn the put would clobber a's slot; with one it
        // recognizes b as a distinct key and keeps both.
        let never: Vec<MatchKeyFn> = vec![Box::new(|_| Ok(false))];
        let previous = index
            .put_batch(std::slice::from_ref(&b), Some(&never))
            .unwrap();
        assert!(previous.is_empty());

        let found_a = index.get(b"aaa", Some(&match_uid(a.uid))).unwrap().unwrap();
        assert_eq!(found_a.position.offset, 8);
        let found_b = index.get(b"bbb", Some(&match_uid(b.uid))).unwrap().unwrap();
        assert_eq!(found_b.position.offset, 80);
    }

    #[test]
    fn test_overwrite_reports_previous() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir, default_key_hash);

        let first = position(&index, b"key", 8);
        index.put_batch(std::slice::from_ref(&first), None).unwrap();

        let second = position(&index, b"key", 88);
        let fns: Vec<MatchKeyFn> = vec![match_uid(first.uid)];
        let previous = index
            .put_batch(std::slice::from_ref(&second), Some(&fns))
            .unwrap();
        assert_eq!(previous.len(), 1);
        assert_eq!(previous[0].uid, first.uid);
    }

    #[test]
    fn test_delete_with_match_fn() {
        let dir = TempDir::new().unwrap();
        let index = test_index(&dir, colliding_hash);

        let a = position(&index, b"aaa", 8);
        let b = position(&index, b"bbb", 80);
        index.put_batch(std::slice::from_ref(&a), None).unwrap();
        let never: Vec<MatchKeyFn> = vec![Box::new(|_| Ok(false))];
        index.put_batch(std::slice::from_ref(&b), Some(&never)).unwrap();

        let fns: Vec<MatchKeyFn> = vec![match_uid(a.uid)];
        let removed = index.delete_batch(&[b"aaa".to_vec()], Some(&fns)).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].uid, a.uid);

        // b survives in the shared bucket.
        let found_b = index.get(b"bbb", Some(&match_uid(b.uid))).unwrap().unwrap();
        assert_eq!(found_b.position.offset, 80);
    }

    #[test]
    fn test_replay_reproduces_supersession() {
        let dir = TempDir::new().unwrap();
        let first;
        let second;
        {
            let index = test_index(&dir, default_key_hash);
            first = position(&index, b"key", 8);
            index.put_batch(std::slice::from_ref(&first), None).unwrap();
            second = position(&index, b"key", 88);
            let fns: Vec<MatchKeyFn> = vec![match_uid(first.uid)];
            index
                .put_batch(std::slice::from_ref(&second), Some(&fns))
                .unwrap();
            index.sync().unwrap();
        }
        let index = test_index(&dir, default_key_hash);
        // Only the newer slot survives replay.
        let found = index.get(b"key", None).unwrap().unwrap();
        assert_eq!(found.uid, second.uid);
        assert!(index
            .get(b"key", Some(&match_uid(first.uid)))
            .unwrap()
            .is_none());
    }
}
