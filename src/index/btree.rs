//! Ordered index backend: exact key bytes mapped to positions.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::{IndexOptions, IndexedPosition, INDEX_LOG_SEGMENT_SIZE};
use crate::error::Result;
use crate::vlog::KeyPosition;
use crate::wal::{Wal, WalOptions};

fn index_log_ext(partition: u32) -> String {
    format!(".index.{partition}")
}

/// One durable mutation of a partition's map.
#[derive(Debug, Serialize, Deserialize)]
enum Edit {
    Put {
        key: Vec<u8>,
        slot: IndexedPosition,
    },
    Delete {
        key: Vec<u8>,
    },
}

struct Partition {
    map: BTreeMap<Vec<u8>, IndexedPosition>,
    log: Wal,
}

impl Partition {
    fn open(opts: &IndexOptions, partition: u32) -> Result<Self> {
        let log = Wal::open(WalOptions {
            dir_path: opts.dir_path.clone(),
            segment_ext: index_log_ext(partition),
            segment_size: INDEX_LOG_SEGMENT_SIZE,
            sync: false,
            block_cache: 0,
        })?;

        let mut map = BTreeMap::new();
        for chunk in log.reader()? {
            let (payload, _) = chunk?;
            match bincode::deserialize::<Edit>(&payload)? {
                Edit::Put { key, slot } => {
                    map.insert(key, slot);
                }
                Edit::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(Self { map, log })
    }
}

/// Partitioned ordered index; each partition is a `BTreeMap` replayed from
/// its edit log.
pub(crate) struct BTreeIndex {
    partitions: Vec<Mutex<Partition>>,
    opts: IndexOptions,
}

impl BTreeIndex {
    pub fn open(opts: IndexOptions) -> Result<Self> {
        let mut partitions = Vec::with_capacity(opts.partition_num as usize);
        for p in 0..opts.partition_num {
            partitions.push(Mutex::new(Partition::open(&opts, p)?));
        }
        Ok(Self { partitions, opts })
    }

    pub fn put_batch(&self, positions: &[KeyPosition]) -> Result<Vec<KeyPosition>> {
        let mut per_partition: Vec<Vec<&KeyPosition>> =
            vec![Vec::new(); self.opts.partition_num as usize];
        for pos in positions {
            per_partition[pos.partition as usize].push(pos);
        }

        let mut previous = Vec::new();
        for (p, batch) in per_partition.iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let mut partition = self.partitions[p].lock()?;
            for pos in batch {
                let slot = IndexedPosition {
                    partition: pos.partition,
                    uid: pos.uid,
                    position: pos.position,
                };
                let edit = Edit::Put {
                    key: pos.key.clone(),
                    slot,
                };
                partition.log.pending_writes(bincode::serialize(&edit)?);
                if let Some(old) = partition.map.insert(pos.key.clone(), slot) {
                    previous.push(old.into_key_position(pos.key.clone()));
                }
            }
            partition.log.write_all()?;
        }
        Ok(previous)
    }

    pub fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<Vec<KeyPosition>> {
        let mut per_partition: Vec<Vec<&Vec<u8>>> =
            vec![Vec::new(); self.opts.partition_num as usize];
        for key in keys {
            per_partition[self.opts.partition_of(key) as usize].push(key);
        }

        let mut previous = Vec::new();
        for (p, batch) in per_partition.iter().enumerate() {
            if batch.is_empty() {
                continue;
            }
            let mut partition = self.partitions[p].lock()?;
            for key in batch {
                if let Some(old) = partition.map.remove(*key) {
                    let edit = Edit::Delete { key: (*key).clone() };
                    partition.log.pending_writes(bincode::serialize(&edit)?);
                    previous.push(old.into_key_position((*key).clone()));
                }
            }
            partition.log.write_all()?;
        }
        Ok(previous)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<KeyPosition>> {
        let partition = self.partitions[self.opts.partition_of(key) as usize].lock()?;
        Ok(partition
            .map
            .get(key)
            .map(|slot| slot.into_key_position(key.to_vec())))
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
