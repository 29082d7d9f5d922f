//! The transactional relational metadata store.
//!
//! Tables: `tree` (path segments), `inodes` (POSIX attributes), `links`
//! (symlink targets), `hashes` (content-hash table), `"index"`
//! (per-inode ordered block lists), `options` (persisted mount
//! options).

use crate::error::{DedupError, DedupResult};
use crate::options::{self, OptionConflict, Options};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

pub const ROOT_TREE_ID: i64 = 1;
pub const ROOT_INODE: u64 = 1;

/// One row of the `inodes` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRow {
    pub inode: u64,
    pub nlinks: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl InodeRow {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// Everything needed to insert a brand-new inode row.
pub struct NewInode {
    pub nlinks: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
}

/// Patch describing which `inodes` columns `setattr`-style callbacks
/// want to change. `None` leaves the column untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrPatch {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
}

pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

pub struct MetaStore {
    conn: Connection,
    use_transactions: bool,
    tx_depth: u32,
}

impl MetaStore {
    /// Opens (or bootstraps) the metadata store at `path`. Returns the
    /// resolved [`Options`] (conflicts already reconciled in favour of
    /// whatever was persisted) and the list of conflicts found, so the
    /// caller can log a warning for each one.
    pub fn open(
        path: &Path,
        uid: u32,
        gid: u32,
        requested: Options,
        use_transactions: bool,
    ) -> DedupResult<(Self, Options, Vec<OptionConflict>)> {
        let first_use = !path.exists();
        let conn = Connection::open(path)?;
        Self::finish_open(conn, uid, gid, requested, use_transactions, first_use)
    }

    pub fn open_in_memory(
        uid: u32,
        gid: u32,
        requested: Options,
        use_transactions: bool,
    ) -> DedupResult<(Self, Options, Vec<OptionConflict>)> {
        let conn = Connection::open_in_memory()?;
        Self::finish_open(conn, uid, gid, requested, use_transactions, true)
    }

    fn finish_open(
        conn: Connection,
        uid: u32,
        gid: u32,
        requested: Options,
        use_transactions: bool,
        first_use: bool,
    ) -> DedupResult<(Self, Options, Vec<OptionConflict>)> {
        let mut store = MetaStore {
            conn,
            use_transactions,
            tx_depth: 0,
        };

        if first_use {
            store.bootstrap(uid, gid, requested)?;
            Ok((store, requested, Vec::new()))
        } else {
            let persisted = store.load_options()?;
            let (resolved, conflicts) = options::reconcile(requested, persisted);
            Ok((store, resolved, conflicts))
        }
    }

    fn bootstrap(&mut self, uid: u32, gid: u32, opts: Options) -> DedupResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE tree (
                id INTEGER PRIMARY KEY,
                parent_id INTEGER,
                name TEXT NOT NULL,
                inode INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX tree_parents_names ON tree(parent_id, name);
            CREATE INDEX tree_parents ON tree(parent_id);
            CREATE INDEX tree_inodes ON tree(inode);

            CREATE TABLE inodes (
                inode INTEGER PRIMARY KEY,
                nlinks INTEGER NOT NULL,
                mode INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                rdev INTEGER NOT NULL,
                size INTEGER NOT NULL,
                atime INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                ctime INTEGER NOT NULL
            );
            CREATE INDEX inodes_sizes ON inodes(inode, size);

            CREATE TABLE links (
                inode INTEGER NOT NULL,
                target BLOB NOT NULL,
                PRIMARY KEY (inode, target)
            );

            CREATE TABLE hashes (
                id INTEGER PRIMARY KEY,
                hash BLOB UNIQUE NOT NULL
            );

            CREATE TABLE "index" (
                inode INTEGER NOT NULL,
                hash_id INTEGER NOT NULL,
                block_nr INTEGER NOT NULL,
                PRIMARY KEY (inode, hash_id, block_nr)
            );

            CREATE TABLE options (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        let t = now();
        self.conn.execute(
            "INSERT INTO tree (id, parent_id, name, inode) VALUES (?1, NULL, '', ?2)",
            params![ROOT_TREE_ID, ROOT_INODE],
        )?;
        self.conn.execute(
            "INSERT INTO inodes (inode, nlinks, mode, uid, gid, rdev, size, atime, mtime, ctime)
             VALUES (?1, 2, ?2, ?3, ?4, 0, 4096, ?5, ?5, ?5)",
            params![ROOT_INODE, S_IFDIR | 0o755, uid, gid, t],
        )?;

        self.save_options(&opts)?;
        Ok(())
    }

    fn save_options(&self, opts: &Options) -> DedupResult<()> {
        let rows: [(&str, String); 4] = [
            ("block_size", opts.block_size.to_string()),
            ("hash_function", opts.hash_function.as_str().to_string()),
            (
                "compression_method",
                opts.compression_method.as_str().to_string(),
            ),
            ("synchronous", opts.synchronous.to_string()),
        ];
        for (name, value) in rows {
            self.conn.execute(
                "INSERT INTO options (name, value) VALUES (?1, ?2)",
                params![name, value],
            )?;
        }
        Ok(())
    }

    fn load_options(&self) -> DedupResult<Options> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM options")?;
        let mut rows = stmt.query([])?;

        let mut opts = Options::default();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            let value: String = row.get(1)?;
            match name.as_str() {
                "block_size" => {
                    opts.block_size = value.parse().map_err(|_| {
                        DedupError::FatalIntegrity("corrupt block_size option".into())
                    })?
                }
                "hash_function" => opts.hash_function = crate::hash::HashAlgorithm::parse(&value)?,
                "compression_method" => {
                    opts.compression_method = crate::compress::CompressionMethod::parse(&value)?
                }
                "synchronous" => opts.synchronous = value == "true",
                _ => {}
            }
        }
        Ok(opts)
    }

    // --- Transaction discipline -------------------------------------
    //
    // Depth-counted: only the outermost `begin`/`commit`/`rollback`
    // emits SQL. Nested operations (e.g. the unlink/link/unlink inside
    // `rename`) call the same methods but never touch the database's
    // transaction state directly, and a rollback anywhere in the nest
    // rolls back everything once the depth reaches zero.

    pub fn begin(&mut self) -> DedupResult<()> {
        if self.tx_depth == 0 && self.use_transactions {
            self.conn.execute_batch("BEGIN")?;
        }
        self.tx_depth += 1;
        Ok(())
    }

    pub fn commit(&mut self) -> DedupResult<()> {
        self.tx_depth = self.tx_depth.saturating_sub(1);
        if self.tx_depth == 0 && self.use_transactions {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> DedupResult<()> {
        self.tx_depth = self.tx_depth.saturating_sub(1);
        if self.tx_depth == 0 && self.use_transactions {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    // --- Tree ---------------------------------------------------------

    pub fn resolve_child(&self, parent_id: i64, name: &str) -> DedupResult<Option<(i64, u64)>> {
        self.conn
            .query_row(
                "SELECT id, inode FROM tree WHERE parent_id = ?1 AND name = ?2",
                params![parent_id, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(DedupError::from)
    }

    pub fn insert_tree(&self, parent_id: i64, name: &str, inode: u64) -> DedupResult<i64> {
        self.conn.execute(
            "INSERT INTO tree (parent_id, name, inode) VALUES (?1, ?2, ?3)",
            params![parent_id, name, inode],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn delete_tree(&self, parent_id: i64, name: &str) -> DedupResult<()> {
        self.conn.execute(
            "DELETE FROM tree WHERE parent_id = ?1 AND name = ?2",
            params![parent_id, name],
        )?;
        Ok(())
    }

    pub fn count_children(&self, parent_id: i64) -> DedupResult<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM tree WHERE parent_id = ?1",
            params![parent_id],
            |row| row.get(0),
        ).map_err(DedupError::from)
    }

    pub fn list_children(&self, parent_id: i64) -> DedupResult<Vec<(u64, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT inode, name FROM tree WHERE parent_id = ?1 ORDER BY name")?;
        let rows = stmt
            .query_map(params![parent_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // --- Inodes ---------------------------------------------------------

    pub fn get_inode(&self, inode: u64) -> DedupResult<Option<InodeRow>> {
        self.conn
            .query_row(
                "SELECT inode, nlinks, mode, uid, gid, rdev, size, atime, mtime, ctime
                 FROM inodes WHERE inode = ?1",
                params![inode],
                |row| {
                    Ok(InodeRow {
                        inode: row.get(0)?,
                        nlinks: row.get(1)?,
                        mode: row.get(2)?,
                        uid: row.get(3)?,
                        gid: row.get(4)?,
                        rdev: row.get(5)?,
                        size: row.get(6)?,
                        atime: row.get(7)?,
                        mtime: row.get(8)?,
                        ctime: row.get(9)?,
                    })
                },
            )
            .optional()
            .map_err(DedupError::from)
    }

    pub fn insert_inode(&self, new: NewInode) -> DedupResult<u64> {
        let t = now();
        self.conn.execute(
            "INSERT INTO inodes (nlinks, mode, uid, gid, rdev, size, atime, mtime, ctime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)",
            params![new.nlinks, new.mode, new.uid, new.gid, new.rdev, new.size, t],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    pub fn delete_inode(&self, inode: u64) -> DedupResult<()> {
        self.conn
            .execute("DELETE FROM inodes WHERE inode = ?1", params![inode])?;
        Ok(())
    }

    pub fn adjust_nlinks(&self, inode: u64, delta: i64) -> DedupResult<()> {
        self.conn.execute(
            "UPDATE inodes SET nlinks = nlinks + ?1 WHERE inode = ?2",
            params![delta, inode],
        )?;
        Ok(())
    }

    pub fn update_size_mtime(&self, inode: u64, size: u64, mtime: i64) -> DedupResult<()> {
        self.conn.execute(
            "UPDATE inodes SET size = ?1, mtime = ?2 WHERE inode = ?3",
            params![size, mtime, inode],
        )?;
        Ok(())
    }

    pub fn apply_attr_patch(&self, inode: u64, patch: &AttrPatch) -> DedupResult<()> {
        if let Some(mode) = patch.mode {
            self.conn
                .execute("UPDATE inodes SET mode = ?1 WHERE inode = ?2", params![mode, inode])?;
        }
        if let Some(uid) = patch.uid {
            self.conn
                .execute("UPDATE inodes SET uid = ?1 WHERE inode = ?2", params![uid, inode])?;
        }
        if let Some(gid) = patch.gid {
            self.conn
                .execute("UPDATE inodes SET gid = ?1 WHERE inode = ?2", params![gid, inode])?;
        }
        if let Some(size) = patch.size {
            self.conn
                .execute("UPDATE inodes SET size = ?1 WHERE inode = ?2", params![size, inode])?;
        }
        if let Some(atime) = patch.atime {
            self.conn.execute(
                "UPDATE inodes SET atime = ?1 WHERE inode = ?2",
                params![atime, inode],
            )?;
        }
        if let Some(mtime) = patch.mtime {
            self.conn.execute(
                "UPDATE inodes SET mtime = ?1 WHERE inode = ?2",
                params![mtime, inode],
            )?;
        }
        if let Some(ctime) = patch.ctime {
            self.conn.execute(
                "UPDATE inodes SET ctime = ?1 WHERE inode = ?2",
                params![ctime, inode],
            )?;
        }
        Ok(())
    }

    // --- Symlinks ---------------------------------------------------------

    pub fn insert_symlink(&self, inode: u64, target: &[u8]) -> DedupResult<()> {
        self.conn.execute(
            "INSERT INTO links (inode, target) VALUES (?1, ?2)",
            params![inode, target],
        )?;
        Ok(())
    }

    pub fn get_symlink_target(&self, inode: u64) -> DedupResult<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT target FROM links WHERE inode = ?1",
                params![inode],
                |row| row.get(0),
            )
            .optional()
            .map_err(DedupError::from)
    }

    pub fn delete_symlink(&self, inode: u64) -> DedupResult<()> {
        self.conn
            .execute("DELETE FROM links WHERE inode = ?1", params![inode])?;
        Ok(())
    }

    // --- Hashes / block index ---------------------------------------------------------

    pub fn find_hash_id(&self, digest: &[u8]) -> DedupResult<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM hashes WHERE hash = ?1",
                params![digest],
                |row| row.get(0),
            )
            .optional()
            .map_err(DedupError::from)
    }

    pub fn insert_hash(&self, digest: &[u8]) -> DedupResult<i64> {
        self.conn
            .execute("INSERT INTO hashes (hash) VALUES (?1)", params![digest])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_hash_bytes(&self, hash_id: i64) -> DedupResult<Vec<u8>> {
        self.conn
            .query_row(
                "SELECT hash FROM hashes WHERE id = ?1",
                params![hash_id],
                |row| row.get(0),
            )
            .map_err(DedupError::from)
    }

    pub fn delete_index_for_inode(&self, inode: u64) -> DedupResult<()> {
        self.conn
            .execute("DELETE FROM \"index\" WHERE inode = ?1", params![inode])?;
        Ok(())
    }

    pub fn insert_index_row(&self, inode: u64, hash_id: i64, block_nr: u32) -> DedupResult<()> {
        self.conn.execute(
            "INSERT INTO \"index\" (inode, hash_id, block_nr) VALUES (?1, ?2, ?3)",
            params![inode, hash_id, block_nr],
        )?;
        Ok(())
    }

    /// Drops index rows for `inode` beyond `last_block`, for truncating a
    /// file down to a block count without rewriting the whole index.
    pub fn delete_index_above(&self, inode: u64, last_block: u32) -> DedupResult<()> {
        self.conn.execute(
            "DELETE FROM \"index\" WHERE inode = ?1 AND block_nr > ?2",
            params![inode, last_block],
        )?;
        Ok(())
    }

    /// Digests for `inode`'s blocks, in ascending `block_nr` order.
    pub fn list_block_digests(&self, inode: u64) -> DedupResult<Vec<Vec<u8>>> {
        let mut stmt = self.conn.prepare(
            "SELECT h.hash FROM \"index\" i JOIN hashes h ON h.id = i.hash_id
             WHERE i.inode = ?1 ORDER BY i.block_nr",
        )?;
        let rows = stmt.query_map(params![inode], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // --- Garbage collection ---------------------------------------------------------

    pub fn delete_orphan_inodes(&self) -> DedupResult<u64> {
        let n = self
            .conn
            .execute("DELETE FROM inodes WHERE nlinks = 0", [])?;
        Ok(n as u64)
    }

    pub fn delete_orphan_index_rows(&self) -> DedupResult<u64> {
        let n = self.conn.execute(
            "DELETE FROM \"index\" WHERE inode NOT IN (SELECT inode FROM inodes)",
            [],
        )?;
        Ok(n as u64)
    }

    pub fn list_orphan_hashes(&self) -> DedupResult<Vec<(i64, Vec<u8>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, hash FROM hashes WHERE id NOT IN (SELECT DISTINCT hash_id FROM \"index\")",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_hash(&self, id: i64) -> DedupResult<()> {
        self.conn
            .execute("DELETE FROM hashes WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Stats ---------------------------------------------------------

    pub fn sum_inode_sizes(&self) -> DedupResult<u64> {
        let sum: Option<i64> = self
            .conn
            .query_row("SELECT SUM(size) FROM inodes", [], |row| row.get(0))?;
        Ok(sum.unwrap_or(0) as u64)
    }

    pub fn count_hashes(&self) -> DedupResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM hashes", [], |row| row.get(0))
            .map_err(DedupError::from)
    }

    pub fn count_inodes(&self) -> DedupResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM inodes", [], |row| row.get(0))
            .map_err(DedupError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fresh() -> MetaStore {
        MetaStore::open_in_memory(1000, 1000, Options::default(), true)
            .unwrap()
            .0
    }

    #[test]
    fn bootstrap_creates_root() {
        let store = open_fresh();
        let root = store.get_inode(ROOT_INODE).unwrap().unwrap();
        assert!(root.is_dir());
        assert_eq!(root.nlinks, 2);
    }

    #[test]
    fn reopen_with_conflicting_options_uses_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.sqlite3");
        let created = Options {
            block_size: 4096,
            ..Options::default()
        };
        {
            let (_store, _resolved, conflicts) =
                MetaStore::open(&path, 1000, 1000, created, true).unwrap();
            assert!(conflicts.is_empty());
        }
        let requested = Options {
            block_size: 8192,
            ..Options::default()
        };
        let (_store, resolved, conflicts) =
            MetaStore::open(&path, 1000, 1000, requested, true).unwrap();
        assert_eq!(resolved.block_size, 4096);
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn insert_and_resolve_child() {
        let store = open_fresh();
        let inode = store
            .insert_inode(NewInode {
                nlinks: 1,
                mode: S_IFREG | 0o644,
                uid: 1000,
                gid: 1000,
                rdev: 0,
                size: 0,
            })
            .unwrap();
        store.insert_tree(ROOT_TREE_ID, "a", inode).unwrap();
        let (_tree_id, resolved_inode) = store.resolve_child(ROOT_TREE_ID, "a").unwrap().unwrap();
        assert_eq!(resolved_inode, inode);
    }

    #[test]
    fn nlinks_adjustment_round_trips() {
        let store = open_fresh();
        let inode = store
            .insert_inode(NewInode {
                nlinks: 1,
                mode: S_IFREG | 0o644,
                uid: 0,
                gid: 0,
                rdev: 0,
                size: 0,
            })
            .unwrap();
        store.adjust_nlinks(inode, 1).unwrap();
        assert_eq!(store.get_inode(inode).unwrap().unwrap().nlinks, 2);
        store.adjust_nlinks(inode, -2).unwrap();
        assert_eq!(store.get_inode(inode).unwrap().unwrap().nlinks, 0);
    }

    #[test]
    fn rmdir_rejects_nonempty_directory_via_count_children() {
        let store = open_fresh();
        let dir_inode = store
            .insert_inode(NewInode {
                nlinks: 2,
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                rdev: 0,
                size: 4096,
            })
            .unwrap();
        let dir_tree = store.insert_tree(ROOT_TREE_ID, "d", dir_inode).unwrap();
        assert_eq!(store.count_children(dir_tree).unwrap(), 0);

        let file_inode = store
            .insert_inode(NewInode {
                nlinks: 1,
                mode: S_IFREG | 0o644,
                uid: 0,
                gid: 0,
                rdev: 0,
                size: 0,
            })
            .unwrap();
        store.insert_tree(dir_tree, "f", file_inode).unwrap();
        assert_eq!(store.count_children(dir_tree).unwrap(), 1);
    }

    #[test]
    fn transaction_depth_suppresses_nested_commit() {
        let mut store = open_fresh();
        store.begin().unwrap();
        store.begin().unwrap();
        store.commit().unwrap();
        assert_eq!(store.tx_depth, 1);
        store.commit().unwrap();
        assert_eq!(store.tx_depth, 0);
    }
}
