//! Durable digest -> compressed-bytes map, backed by `sled`.

use crate::error::DedupResult;
use std::path::Path;

/// Durable key/value store from content digest to compressed block
/// bytes. `put` is last-writer-wins; the write-buffer flush pipeline
/// only ever calls `put` for digests it has just confirmed are
/// absent, so overwriting an existing digest with different bytes never
/// happens by construction.
pub struct BlockStore {
    db: sled::Db,
}

impl BlockStore {
    pub fn open(path: &Path) -> DedupResult<Self> {
        let db = sled::open(path)?;
        Ok(BlockStore { db })
    }

    pub fn get(&self, digest: &[u8]) -> DedupResult<Option<Vec<u8>>> {
        Ok(self.db.get(digest)?.map(|ivec| ivec.to_vec()))
    }

    pub fn put(&self, digest: &[u8], bytes: &[u8]) -> DedupResult<()> {
        self.db.insert(digest, bytes)?;
        Ok(())
    }

    pub fn delete(&self, digest: &[u8]) -> DedupResult<()> {
        self.db.remove(digest)?;
        Ok(())
    }

    pub fn contains(&self, digest: &[u8]) -> DedupResult<bool> {
        Ok(self.db.contains_key(digest)?)
    }

    /// Flushes pending writes to disk. Called from `release` when
    /// `synchronous` is enabled, and always on `destroy`.
    pub fn sync(&self) -> DedupResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn close(self) -> DedupResult<()> {
        self.sync()
    }

    /// On-disk footprint, used by `--print-stats` for the physical-size
    /// half of the usage report.
    pub fn physical_size(&self) -> DedupResult<u64> {
        Ok(self.db.size_on_disk()?)
    }

    pub fn block_count(&self) -> u64 {
        self.db.len() as u64
    }
}
