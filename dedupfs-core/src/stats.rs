//! Disk usage reporting behind `--print-stats`.
//!
//! Apparent size is the sum of every inode's logical `size` column;
//! physical size is the combined on-disk footprint of both stores.

use crate::blockstore::BlockStore;
use crate::error::DedupResult;
use crate::metastore::MetaStore;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub apparent_size: u64,
    pub physical_size: u64,
    pub inode_count: i64,
    pub hash_count: i64,
}

impl DiskUsage {
    pub fn collect(meta: &MetaStore, blocks: &BlockStore, metastore_file_bytes: u64) -> DedupResult<Self> {
        Ok(DiskUsage {
            apparent_size: meta.sum_inode_sizes()?,
            physical_size: blocks.physical_size()? + metastore_file_bytes,
            inode_count: meta.count_inodes()?,
            hash_count: meta.count_hashes()?,
        })
    }
}

impl fmt::Display for DiskUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ratio = if self.physical_size == 0 {
            0.0
        } else {
            self.apparent_size as f64 / self.physical_size as f64
        };
        write!(
            f,
            "apparent size: {} bytes, physical size: {} bytes (ratio {:.2}x), {} inodes, {} unique blocks",
            self.apparent_size, self.physical_size, ratio, self.inode_count, self.hash_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::{NewInode, ROOT_TREE_ID, S_IFREG};
    use crate::options::Options;

    #[test]
    fn apparent_size_sums_inode_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let (meta, _opts, _conflicts) =
            MetaStore::open_in_memory(1000, 1000, Options::default(), true).unwrap();
        let blocks = BlockStore::open(&dir.path().join("blocks")).unwrap();

        let inode = meta
            .insert_inode(NewInode {
                nlinks: 1,
                mode: S_IFREG | 0o644,
                uid: 0,
                gid: 0,
                rdev: 0,
                size: 0,
            })
            .unwrap();
        meta.insert_tree(ROOT_TREE_ID, "f", inode).unwrap();
        meta.update_size_mtime(inode, 1234, crate::metastore::now())
            .unwrap();

        let usage = DiskUsage::collect(&meta, &blocks, 0).unwrap();
        // Root directory (4096) + the one file (1234).
        assert_eq!(usage.apparent_size, 4096 + 1234);
    }
}
