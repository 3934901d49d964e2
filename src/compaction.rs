//! Value-log compaction: per-partition rewrites that reclaim dead records.
//!
//! Both strategies share one shape: stream every chunk of the partition,
//! keep the records that are still live, append them to a temp file
//! (`.tvlog.<p>`), re-index them in batches, then swap the temp file in for
//! the old one. They differ only in the liveness test:
//!
//! - **Full scan** asks the index whether the record's position is still the
//!   key's current position. It is the only strategy that works when the
//!   deprecated sets are not yet authoritative, so the first compaction
//!   after open always uses it.
//! - **Deprecated-driven** trusts the per-partition deprecated sets built up
//!   by flushes since open. Under the hash index the position check is
//!   applied as well, because hash-index equality is imprecise.
//!
//! Partitions are rewritten in parallel; the first failure aborts the
//! remaining workers and the failed partition abandons its temp file while
//! its old file stays in service. The whole run holds the flush lock, so
//! compaction and flush never interleave.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::db::DbInner;
use crate::error::Result;
use crate::index::{Index, MatchKeyFn};
use crate::vlog::{temp_value_log_ext, value_log_ext, KeyPosition, ValueLog, ValueLogRecord};
use crate::wal::{ChunkPosition, Wal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompactionStrategy {
    FullScan,
    DeprecatedDriven,
}

/// Everything one partition worker needs, passed explicitly instead of
/// closed over.
struct CompactionContext<'a> {
    partition: u32,
    strategy: CompactionStrategy,
    batch_count: usize,
    index: &'a Index,
    vlog: &'a ValueLog,
    /// The partition file being rewritten.
    source: &'a Wal,
    /// The temp file receiving live records.
    target: &'a Wal,
    use_match_keys: bool,
}

/// Rewrites every partition in parallel under the flush lock.
pub(crate) async fn run_compaction(
    inner: Arc<DbInner>,
    strategy: CompactionStrategy,
) -> Result<()> {
    let _guard = inner.flush_lock.lock().await;
    tracing::info!(?strategy, "starting value log compaction");

    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    for partition in 0..inner.vlog.partition_num() {
        let inner = Arc::clone(&inner);
        workers.spawn_blocking(move || compact_partition(&inner, partition, strategy));
    }

    let mut result = Ok(());
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if result.is_ok() {
                    result = Err(e);
                }
                // First failure cancels the partitions that have not started.
                workers.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
    }

    if result.is_ok() {
        inner.vlog.clean_deprecated_table();
        tracing::info!(?strategy, "value log compaction finished");
    }
    result
}

/// Rewrites one partition and swaps the rewritten file in. Holding the
/// partition write lock for the whole rewrite quiesces that partition's
/// readers; the old file is deleted only after the new one is synced and
/// renamed into place.
fn compact_partition(
    inner: &DbInner,
    partition: u32,
    strategy: CompactionStrategy,
) -> Result<()> {
    inner.vlog.with_partition_mut(partition, |source| {
        let target = inner
            .vlog
            .open_partition_file(partition, temp_value_log_ext(partition))?;

        let outcome = {
            let ctx = CompactionContext {
                partition,
                strategy,
                batch_count: inner.options.compact_batch_count,
                index: &inner.index,
                vlog: &inner.vlog,
                source,
                target: &target,
                use_match_keys: inner.index.needs_match_keys(),
            };
            rewrite_partition(&ctx)
        };

        match outcome {
            Ok((scanned, kept)) => {
                target.close()?;
                source.delete()?;
                target.rename_ext(&value_log_ext(partition))?;
                drop(target);
                *source = inner
                    .vlog
                    .open_partition_file(partition, value_log_ext(partition))?;
                if strategy == CompactionStrategy::FullScan {
                    inner.vlog.clean_partition_deprecated(partition);
                }
                tracing::info!(partition, scanned, kept, "value log partition compacted");
                Ok(())
            }
            Err(e) => {
                tracing::error!(partition, error = %e, "partition compaction failed, old file kept");
                let _ = target.delete();
                Err(e)
            }
        }
    })
}

/// Streams the partition and rewrites the records that are still live.
/// Returns `(scanned, kept)` counts.
fn rewrite_partition(ctx: &CompactionContext<'_>) -> Result<(usize, usize)> {
    let mut valid: Vec<ValueLogRecord> = Vec::with_capacity(ctx.batch_count);
    let mut scanned = 0usize;
    let mut kept = 0usize;

    for chunk in ctx.source.reader()? {
        let (payload, pos) = chunk?;
        scanned += 1;
        let record = ValueLogRecord::decode(&payload)?;

        let keep = match ctx.strategy {
            CompactionStrategy::FullScan => is_live_in_index(ctx, &record, pos)?,
            CompactionStrategy::DeprecatedDriven => {
                if ctx.vlog.is_deprecated(ctx.partition, &record.uid) {
                    false
                } else if ctx.use_match_keys {
                    // Hash-index equality is imprecise, so the deprecated
                    // check alone cannot be trusted.
                    is_live_in_index(ctx, &record, pos)?
                } else {
                    true
                }
            }
        };

        if keep {
            kept += 1;
            valid.push(record);
        }
        if scanned % ctx.batch_count == 0 {
            rewrite_valid_records(ctx, &mut valid)?;
        }
    }
    rewrite_valid_records(ctx, &mut valid)?;
    Ok((scanned, kept))
}

/// Whether the index still points at exactly this record's position.
fn is_live_in_index(
    ctx: &CompactionContext<'_>,
    record: &ValueLogRecord,
    pos: ChunkPosition,
) -> Result<bool> {
    let match_fn = ctx
        .use_match_keys
        .then(|| source_match_fn(ctx.source, record.key.clone()));
    let current = ctx.index.get(&record.key, match_fn.as_ref())?;
    Ok(matches!(
        current,
        Some(kp) if kp.partition == ctx.partition && kp.position == pos
    ))
}

/// Flushes the batched live records into the temp file and re-points the
/// index at their new positions. The previous positions the index reports
/// all refer to the file this rewrite is about to delete, so they are
/// discarded rather than deprecated.
fn rewrite_valid_records(
    ctx: &CompactionContext<'_>,
    valid: &mut Vec<ValueLogRecord>,
) -> Result<()> {
    if valid.is_empty() {
        return Ok(());
    }
    for record in valid.iter() {
        ctx.target.pending_writes(record.encode());
    }
    let chunk_positions = ctx.target.write_all()?;

    let positions: Vec<KeyPosition> = valid
        .drain(..)
        .zip(chunk_positions)
        .map(|(record, position)| KeyPosition {
            key: record.key,
            partition: ctx.partition,
            uid: record.uid,
            position,
        })
        .collect();

    let match_fns: Option<Vec<MatchKeyFn<'_>>> = ctx.use_match_keys.then(|| {
        positions
            .iter()
            .map(|kp| source_match_fn(ctx.source, kp.key.clone()))
            .collect()
    });
    ctx.index.put_batch(&positions, match_fns.as_deref())?;
    Ok(())
}

/// Match fn that resolves candidate slots against the partition file being
/// rewritten. A slot whose position cannot be read from the source file was
/// already re-pointed at the temp file by an earlier batch, which means it
/// belongs to a different (colliding) key.
fn source_match_fn(source: &Wal, key: Vec<u8>) -> MatchKeyFn<'_> {
    Box::new(move |slot| match source.read(slot.position) {
        Ok(chunk) => Ok(ValueLogRecord::decode(&chunk)
            .map(|record| record.key == key)
            .unwrap_or(false)),
        Err(_) => Ok(false),
    })
}
