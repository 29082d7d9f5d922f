//! Background garbage collector.
//!
//! Three ordered sweeps inside a single transaction, each idempotent:
//! dead inodes, then orphan index rows, then orphan blocks. Re-running
//! after a partial failure only ever removes more of the same garbage.

use crate::blockstore::BlockStore;
use crate::error::DedupResult;
use crate::metastore::MetaStore;
use log::info;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub inodes_removed: u64,
    pub index_rows_removed: u64,
    pub blocks_removed: u64,
}

/// Runs one GC pass. The caller is responsible for only invoking this
/// when GC is enabled and the store is writable, and for wrapping it in
/// a transaction boundary consistent with the rest of that callback
/// (the adapter's `begin`/`commit` around the triggering operation, or
/// its own transaction on `destroy`).
pub fn collect(meta: &MetaStore, blocks: &BlockStore) -> DedupResult<GcReport> {
    let inodes_removed = meta.delete_orphan_inodes()?;
    let index_rows_removed = meta.delete_orphan_index_rows()?;

    let orphan_hashes = meta.list_orphan_hashes()?;
    let mut blocks_removed = 0u64;
    for (hash_id, digest) in orphan_hashes {
        blocks.delete(&digest)?;
        meta.delete_hash(hash_id)?;
        blocks_removed += 1;
    }

    let report = GcReport {
        inodes_removed,
        index_rows_removed,
        blocks_removed,
    };
    if report.inodes_removed > 0 || report.index_rows_removed > 0 || report.blocks_removed > 0 {
        info!(
            "gc: removed {} inodes, {} index rows, {} blocks",
            report.inodes_removed, report.index_rows_removed, report.blocks_removed
        );
    }
    Ok(report)
}
