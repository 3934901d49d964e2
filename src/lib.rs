//! emberdb is an embedded, durable, ordered key-value store.
//!
//! It pairs a write-optimized memtable tier (skip lists backed by
//! write-ahead logs) with a read-optimized on-disk tier in which a
//! partitioned index maps keys to records appended to a partitioned value
//! log. Deleted and overwritten records are reclaimed by a per-partition
//! compactor driven by deprecated-record accounting and a disk-IO-aware
//! control loop.
//!
//! Background work (flush, auto-compaction, disk sampling) runs on tokio
//! tasks, so [`Db::open`] must be called from within a tokio runtime.
//!
//! ```no_run
//! use emberdb::{Db, Options};
//!
//! #[tokio::main]
//! async fn main() -> emberdb::Result<()> {
//!     let db = Db::open(Options::new("/tmp/emberdb"))?;
//!     db.put(b"Hello", b"World")?;
//!     assert_eq!(db.get(b"Hello")?, b"World");
//!     db.close().await
//! }
//! ```

pub mod batch;
pub mod config;
pub mod db;
pub mod error;

mod cache;
mod compaction;
mod diskio;
mod encoding;
mod flock;
mod index;
mod memtable;
mod vlog;
mod wal;

pub use batch::Batch;
pub use config::{BatchOptions, IndexType, KeyHashFn, Options, WriteOptions};
pub use db::Db;
pub use error::{Error, Result};
