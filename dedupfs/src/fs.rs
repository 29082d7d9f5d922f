//! The VFS adapter. Implements `fuser::Filesystem` against the
//! storage engine in `dedupfs-core`.
//!
//! `fuser` addresses everything by inode number, not by path, so this
//! module keeps one extra piece of state the core doesn't need itself:
//! `ino_paths`, a best-effort inode -> absolute-path map refreshed on
//! every successful `lookup`/`create`/`mkdir`/`mknod`/`symlink`/`link`,
//! used purely to hand the path-keyed [`dedupfs_core::pathcache`] and
//! [`dedupfs_core::writebuf`] APIs a path to work with. For a
//! hard-linked regular file this tracks only the most recently resolved
//! name, the same approximation an inode-based kernel bridge forces on
//! any path-shaped engine underneath it.

use dedupfs_core::blockstore::BlockStore;
use dedupfs_core::error::DedupError;
use dedupfs_core::gc;
use dedupfs_core::metastore::{self, AttrPatch, InodeRow, MetaStore, NewInode, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use dedupfs_core::options::{Options, RuntimeConfig};
use dedupfs_core::pathcache::PathCache;
use dedupfs_core::writebuf::{self, Buffer};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use log::{error, trace, warn};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

const TTL: Duration = Duration::from_secs(1);
/// GC hook: consult the clock every this many successful mutating
/// callbacks.
const GC_OP_THRESHOLD: u32 = 500;
/// GC hook: minimum wall-clock gap between GC runs.
const GC_INTERVAL: Duration = Duration::from_secs(60);

struct OpenHandle {
    path: PathBuf,
}

pub struct DedupFs {
    meta: MetaStore,
    blocks: BlockStore,
    cache: PathCache,
    options: Options,
    runtime: RuntimeConfig,
    read_only: bool,
    /// Directory the metadata store lives in, used as the reference
    /// filesystem for `statfs`.
    host_dir: PathBuf,

    ino_paths: HashMap<u64, PathBuf>,
    buffers: HashMap<PathBuf, Buffer>,
    open_handles: HashMap<u64, OpenHandle>,
    next_fh: u64,

    op_counter: u32,
    last_gc: Instant,
}

impl DedupFs {
    pub fn open(
        metastore_path: &Path,
        datastore_path: &Path,
        requested: Options,
        runtime: RuntimeConfig,
    ) -> anyhow::Result<Self> {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let read_only = metastore_path.exists() && is_read_only(metastore_path);

        let (meta, options, conflicts) = MetaStore::open(
            metastore_path,
            uid,
            gid,
            requested,
            runtime.use_transactions,
        )?;
        for c in &conflicts {
            warn!(
                "ignoring requested {} {:?}: store was created with {:?}",
                c.name, c.requested, c.persisted
            );
        }
        let blocks = BlockStore::open(datastore_path)?;

        let mut ino_paths = HashMap::new();
        ino_paths.insert(metastore::ROOT_INODE, PathBuf::from("/"));
        let host_dir = metastore_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        Ok(DedupFs {
            meta,
            blocks,
            cache: PathCache::new(),
            options,
            runtime,
            read_only,
            host_dir,
            ino_paths,
            buffers: HashMap::new(),
            open_handles: HashMap::new(),
            next_fh: 1,
            op_counter: 0,
            last_gc: Instant::now(),
        })
    }

    fn path_for(&self, ino: u64) -> Option<PathBuf> {
        self.ino_paths.get(&ino).cloned()
    }

    fn child_path(parent: &Path, name: &OsStr) -> PathBuf {
        if parent == Path::new("/") {
            PathBuf::from("/").join(name)
        } else {
            parent.join(name)
        }
    }

    fn to_attr(row: &InodeRow) -> FileAttr {
        let kind = match row.mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::RegularFile,
        };
        FileAttr {
            ino: row.inode,
            size: row.size,
            blocks: row.size.div_ceil(512),
            atime: epoch(row.atime),
            mtime: epoch(row.mtime),
            ctime: epoch(row.ctime),
            crtime: epoch(row.ctime),
            kind,
            perm: (row.mode & 0o7777) as u16,
            nlink: row.nlinks,
            uid: row.uid,
            gid: row.gid,
            rdev: row.rdev,
            blksize: 4096,
            flags: 0,
        }
    }

    /// `access`: owner bits if the caller is the owning uid, else
    /// group bits if the caller is in the owning gid, else other bits.
    fn check_permission(row: &InodeRow, uid: u32, gid: u32, mask: i32) -> bool {
        if mask == libc::F_OK {
            return true;
        }
        let shift = if uid == row.uid {
            6
        } else if gid == row.gid {
            3
        } else {
            0
        };
        let allowed = (row.mode >> shift) & 0o7;
        let requested = mask as u32 & 0o7;
        allowed & requested == requested
    }

    fn begin(&mut self) {
        let _ = self.meta.begin();
    }

    fn commit(&mut self) {
        let _ = self.meta.commit();
        self.maybe_run_gc();
    }

    fn rollback(&mut self) {
        let _ = self.meta.rollback();
    }

    /// GC hook: every `GC_OP_THRESHOLD` successful mutating
    /// callbacks, if `GC_INTERVAL` has elapsed and GC is enabled and the
    /// mount is writable, run a collection pass.
    fn maybe_run_gc(&mut self) {
        if self.read_only || !self.runtime.gc_enabled {
            return;
        }
        self.op_counter += 1;
        if self.op_counter < GC_OP_THRESHOLD {
            return;
        }
        self.op_counter = 0;
        if self.last_gc.elapsed() < GC_INTERVAL {
            return;
        }
        self.last_gc = Instant::now();
        match gc::collect(&self.meta, &self.blocks) {
            Ok(report) => trace!("periodic gc: {report:?}"),
            Err(e) => warn!("periodic gc failed: {e}"),
        }
    }

    fn ensure_buffer_populated(&mut self, path: &Path, inode: u64) -> Result<(), DedupError> {
        if !self.buffers.contains_key(path) {
            let mut buffer = Buffer::new();
            buffer.populate(inode, &self.meta, &self.blocks, self.options.compression_method)?;
            self.buffers.insert(path.to_path_buf(), buffer);
        }
        Ok(())
    }

    /// Handles a `DedupError::FatalIntegrity`: diagnostics were already
    /// written by `writebuf::flush`. Per the error-handling design this
    /// is unrecoverable at the process level, not just at the callback
    /// level, so there is no errno to reply with: we log and exit.
    fn abort_on_fatal_integrity(err: &DedupError) -> ! {
        error!("fatal integrity failure, aborting process: {err}");
        std::process::exit(1);
    }
}

fn is_read_only(path: &Path) -> bool {
    std::fs::OpenOptions::new().append(true).open(path).is_err()
}

/// Maps an `open`/`create` flags argument to the `access`-style mask it
/// implies, so `open`/`create` can run the same permission check `access`
/// does before handing back a file handle.
fn access_mask_for_open_flags(flags: i32) -> i32 {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => libc::W_OK,
        libc::O_RDWR => libc::R_OK | libc::W_OK,
        _ => libc::R_OK,
    }
}

fn epoch(unix_secs: i64) -> SystemTime {
    if unix_secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(unix_secs as u64)
    } else {
        SystemTime::UNIX_EPOCH
    }
}

fn time_or_now(t: Option<TimeOrNow>, current: i64) -> i64 {
    match t {
        Some(TimeOrNow::SpecificTime(t)) => t
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(current),
        Some(TimeOrNow::Now) => metastore::now(),
        None => current,
    }
}

impl Filesystem for DedupFs {
    fn destroy(&mut self) {
        if !self.read_only && self.runtime.gc_enabled {
            match gc::collect(&self.meta, &self.blocks) {
                Ok(report) => trace!("final gc on unmount: {report:?}"),
                Err(e) => warn!("final gc on unmount failed: {e}"),
            }
        }
        let _ = self.blocks.sync();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.cache.resolve(&self.meta, &child_path.to_string_lossy()) {
            Ok((_tree_id, inode)) => match self.meta.get_inode(inode) {
                Ok(Some(row)) => {
                    self.ino_paths.insert(inode, child_path);
                    reply.entry(&TTL, &Self::to_attr(&row), 0);
                }
                Ok(None) => reply.error(libc::ENOENT),
                Err(e) => reply.error(e.to_errno()),
            },
            Err(DedupError::NoSuchEntry) => {
                trace!("lookup miss for {}", child_path.display());
                reply.error(libc::ENOENT);
            }
            Err(e) => reply.error(e.to_errno()),
        }
        let _ = req;
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.meta.get_inode(ino) {
            Ok(Some(row)) => reply.attr(&TTL, &Self::to_attr(&row)),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Ok(Some(current)) = self.meta.get_inode(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        self.begin();
        let patch = AttrPatch {
            mode: mode.map(|m| (current.mode & S_IFMT) | (m & 0o7777)),
            uid,
            gid,
            size,
            atime: atime.map(|t| time_or_now(Some(t), current.atime)),
            mtime: mtime.map(|t| time_or_now(Some(t), current.mtime)),
            ctime: Some(metastore::now()),
        };
        let truncate_result = size.map(|new_size| {
            if new_size == 0 {
                self.meta.delete_index_for_inode(ino)
            } else {
                let last_block = ((new_size - 1) / self.options.block_size as u64) as u32;
                self.meta.delete_index_above(ino, last_block)
            }
        });

        match truncate_result.unwrap_or(Ok(())).and_then(|()| self.meta.apply_attr_patch(ino, &patch)) {
            Ok(()) => {
                self.commit();
                if let Some(new_size) = size {
                    if let Some(path) = self.path_for(ino) {
                        if let Some(buffer) = self.buffers.get_mut(&path) {
                            buffer.truncate(new_size);
                        }
                    }
                }
                match self.meta.get_inode(ino) {
                    Ok(Some(row)) => reply.attr(&TTL, &Self::to_attr(&row)),
                    Ok(None) => reply.error(libc::ENOENT),
                    Err(e) => reply.error(e.to_errno()),
                }
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.meta.get_symlink_target(ino) {
            Ok(Some(target)) => reply.data(&target),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        self.create_entry(req, parent, name, mode, rdev, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);

        self.begin();
        let result = (|| {
            let (parent_tree, _) = self.cache.resolve(&self.meta, &parent_path.to_string_lossy())?;
            let inode = self.meta.insert_inode(NewInode {
                nlinks: 2,
                mode: S_IFDIR | (mode & 0o7777),
                uid: req.uid(),
                gid: req.gid(),
                rdev: 0,
                size: 4096,
            })?;
            let tree_id = self.meta.insert_tree(parent_tree, &name.to_string_lossy(), inode)?;
            self.meta.adjust_nlinks(parent, 1)?;
            self.cache.insert(
                &parent_path.to_string_lossy(),
                &name.to_string_lossy(),
                tree_id,
                inode,
            );
            Ok::<u64, DedupError>(inode)
        })();

        match result {
            Ok(inode) => {
                self.commit();
                self.ino_paths.insert(inode, child_path);
                match self.meta.get_inode(inode) {
                    Ok(Some(row)) => reply.entry(&TTL, &Self::to_attr(&row), 0),
                    _ => reply.error(libc::EIO),
                }
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        match self.unlink_entry(parent, name) {
            Ok(()) => {
                self.commit();
                reply.ok();
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        self.begin();
        let result = (|| {
            let Some(parent_path) = self.path_for(parent) else {
                return Err(DedupError::NoSuchEntry);
            };
            let child_path = Self::child_path(&parent_path, name);
            let (tree_id, inode) = self.cache.resolve(&self.meta, &child_path.to_string_lossy())?;
            if self.meta.count_children(tree_id)? != 0 {
                return Err(DedupError::NotEmpty);
            }
            self.meta.delete_tree(
                self.cache.resolve(&self.meta, &parent_path.to_string_lossy())?.0,
                &name.to_string_lossy(),
            )?;
            self.meta.adjust_nlinks(inode, -2)?;
            self.meta.adjust_nlinks(parent, -1)?;
            self.cache
                .invalidate(&parent_path.to_string_lossy(), &name.to_string_lossy());
            self.ino_paths.remove(&inode);
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.commit();
                reply.ok();
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child_path = Self::child_path(&parent_path, link_name);
        let target_bytes = target.to_string_lossy().as_bytes().to_vec();

        self.begin();
        let result = (|| {
            let (parent_tree, _) = self.cache.resolve(&self.meta, &parent_path.to_string_lossy())?;
            let inode = self.meta.insert_inode(NewInode {
                nlinks: 1,
                mode: S_IFLNK | 0o777,
                uid: req.uid(),
                gid: req.gid(),
                rdev: 0,
                size: target_bytes.len() as u64,
            })?;
            self.meta.insert_symlink(inode, &target_bytes)?;
            let tree_id = self.meta.insert_tree(
                parent_tree,
                &link_name.to_string_lossy(),
                inode,
            )?;
            self.cache.insert(
                &parent_path.to_string_lossy(),
                &link_name.to_string_lossy(),
                tree_id,
                inode,
            );
            Ok::<u64, DedupError>(inode)
        })();

        match result {
            Ok(inode) => {
                self.commit();
                self.ino_paths.insert(inode, child_path);
                match self.meta.get_inode(inode) {
                    Ok(Some(row)) => reply.entry(&TTL, &Self::to_attr(&row), 0),
                    _ => reply.error(libc::EIO),
                }
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let (Some(old_parent_path), Some(new_parent_path)) =
            (self.path_for(parent), self.path_for(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let old_path = Self::child_path(&old_parent_path, name);
        let new_path = Self::child_path(&new_parent_path, newname);

        // Nested transaction: `rename` is atomically an optional unlink
        // of the destination, a link of old -> new, and an unlink of
        // old. The sub-steps share this one transaction boundary and
        // never commit or roll back on their own.
        self.begin();
        let result = (|| {
            match self.cache.resolve(&self.meta, &new_path.to_string_lossy()) {
                Ok(_) => match self.unlink_entry(newparent, newname) {
                    Ok(()) | Err(DedupError::NoSuchEntry) => {}
                    Err(e) => return Err(e),
                },
                Err(DedupError::NoSuchEntry) => {}
                Err(e) => return Err(e),
            }

            let (_old_tree, inode) = self.cache.resolve(&self.meta, &old_path.to_string_lossy())?;
            let (new_parent_tree, _) =
                self.cache.resolve(&self.meta, &new_parent_path.to_string_lossy())?;
            let tree_id = self.meta.insert_tree(new_parent_tree, &newname.to_string_lossy(), inode)?;
            self.meta.adjust_nlinks(inode, 1)?;
            self.cache.insert(
                &new_parent_path.to_string_lossy(),
                &newname.to_string_lossy(),
                tree_id,
                inode,
            );

            self.unlink_entry(parent, name)?;
            Ok(inode)
        })();

        match result {
            Ok(inode) => {
                self.commit();
                self.ino_paths.insert(inode, new_path);
                reply.ok();
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(new_parent_path) = self.path_for(newparent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let new_path = Self::child_path(&new_parent_path, newname);

        self.begin();
        let result = (|| {
            let (parent_tree, _) =
                self.cache.resolve(&self.meta, &new_parent_path.to_string_lossy())?;
            let tree_id = self.meta.insert_tree(parent_tree, &newname.to_string_lossy(), ino)?;
            self.meta.adjust_nlinks(ino, 1)?;
            self.cache.insert(
                &new_parent_path.to_string_lossy(),
                &newname.to_string_lossy(),
                tree_id,
                ino,
            );
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.commit();
                self.ino_paths.insert(ino, new_path);
                match self.meta.get_inode(ino) {
                    Ok(Some(row)) => reply.entry(&TTL, &Self::to_attr(&row), 0),
                    _ => reply.error(libc::EIO),
                }
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        // If the path already exists, `create` behaves like `open`. The
        // resolve below makes that distinction before falling into the
        // same insert path `mknod` uses.
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);
        if let Ok((_tree_id, inode)) = self.cache.resolve(&self.meta, &child_path.to_string_lossy()) {
            let row = match self.meta.get_inode(inode) {
                Ok(Some(row)) => row,
                Ok(None) => {
                    reply.error(libc::ENOENT);
                    return;
                }
                Err(e) => {
                    reply.error(e.to_errno());
                    return;
                }
            };
            let mask = access_mask_for_open_flags(flags);
            if self.read_only && mask & libc::W_OK != 0 {
                reply.error(libc::EROFS);
                return;
            }
            if !Self::check_permission(&row, req.uid(), req.gid(), mask) {
                reply.error(libc::EACCES);
                return;
            }
            let fh = self.allocate_fh(child_path.clone());
            reply.created(&TTL, &Self::to_attr(&row), 0, fh, 0);
            return;
        }

        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }

        self.begin();
        let result = (|| {
            let (parent_tree, _) = self.cache.resolve(&self.meta, &parent_path.to_string_lossy())?;
            let inode = self.meta.insert_inode(NewInode {
                nlinks: 1,
                mode: S_IFREG | (mode & 0o7777),
                uid: req.uid(),
                gid: req.gid(),
                rdev: 0,
                size: 0,
            })?;
            let tree_id = self.meta.insert_tree(parent_tree, &name.to_string_lossy(), inode)?;
            self.cache
                .insert(&parent_path.to_string_lossy(), &name.to_string_lossy(), tree_id, inode);
            Ok::<u64, DedupError>(inode)
        })();

        match result {
            Ok(inode) => {
                self.commit();
                self.ino_paths.insert(inode, child_path.clone());
                let fh = self.allocate_fh(child_path);
                match self.meta.get_inode(inode) {
                    Ok(Some(row)) => reply.created(&TTL, &Self::to_attr(&row), 0, fh, 0),
                    _ => reply.error(libc::EIO),
                }
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let row = match self.meta.get_inode(ino) {
            Ok(Some(row)) => row,
            Ok(None) => {
                reply.error(libc::ENOENT);
                return;
            }
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let mask = access_mask_for_open_flags(flags);
        if self.read_only && mask & libc::W_OK != 0 {
            reply.error(libc::EROFS);
            return;
        }
        if !Self::check_permission(&row, req.uid(), req.gid(), mask) {
            reply.error(libc::EACCES);
            return;
        }
        let fh = self.allocate_fh(path);
        reply.opened(fh, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.open_handles.get(&fh).map(|h| h.path.clone()) else {
            reply.error(libc::EBADF);
            return;
        };
        if let Err(e) = self.ensure_buffer_populated(&path, ino) {
            reply.error(e.to_errno());
            return;
        }
        let buffer = self.buffers.get(&path).expect("just populated");
        reply.data(buffer.read(offset.max(0) as u64, size as u64));
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(path) = self.open_handles.get(&fh).map(|h| h.path.clone()) else {
            reply.error(libc::EBADF);
            return;
        };
        if let Err(e) = self.ensure_buffer_populated(&path, ino) {
            reply.error(e.to_errno());
            return;
        }
        let written = self
            .buffers
            .get_mut(&path)
            .expect("just populated")
            .write(offset.max(0) as u64, data);
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // The flush-to-stores pipeline runs at `release`, not here: the
        // buffer is only durably reconciled when the file is closed.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.open_handles.remove(&fh) else {
            reply.ok();
            return;
        };
        let Some(mut buffer) = self.buffers.remove(&handle.path) else {
            reply.ok();
            return;
        };

        self.begin();
        let result = writebuf::flush(
            &mut buffer,
            ino,
            &self.meta,
            &self.blocks,
            self.options.block_size,
            self.options.hash_function,
            self.options.compression_method,
            self.runtime.verify_writes,
        );
        match result {
            Ok(_report) => {
                self.commit();
                reply.ok();
            }
            Err(e @ DedupError::FatalIntegrity(_)) => {
                self.rollback();
                Self::abort_on_fatal_integrity(&e);
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(ino, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (tree_id, _) = match self.cache.resolve(&self.meta, &path.to_string_lossy()) {
            Ok(v) => v,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = if path == Path::new("/") {
            ino
        } else {
            let parent_path = path.parent().unwrap_or(Path::new("/"));
            self.cache
                .resolve(&self.meta, &parent_path.to_string_lossy())
                .map(|(_, i)| i)
                .unwrap_or(ino)
        };

        let mut entries = vec![(ino, FileType::Directory, ".".to_string())];
        entries.push((parent_ino, FileType::Directory, "..".to_string()));

        match self.meta.list_children(tree_id) {
            Ok(children) => {
                for (child_ino, name) in children {
                    let kind = match self.meta.get_inode(child_ino) {
                        Ok(Some(row)) => match row.mode & S_IFMT {
                            S_IFDIR => FileType::Directory,
                            S_IFLNK => FileType::Symlink,
                            _ => FileType::RegularFile,
                        },
                        _ => FileType::RegularFile,
                    };
                    entries.push((child_ino, kind, name));
                }
            }
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match host_statvfs(&self.options, &self.host_dir) {
            Ok((blocks, bfree, bavail, files, ffree, bsize, namelen, frsize)) => {
                reply.statfs(blocks, bfree, bavail, files, ffree, bsize, namelen, frsize)
            }
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.meta.get_inode(ino) {
            Ok(Some(row)) => {
                if self.read_only && mask & libc::W_OK != 0 {
                    reply.error(libc::EROFS);
                } else if Self::check_permission(&row, req.uid(), req.gid(), mask) {
                    reply.ok();
                } else {
                    reply.error(libc::EACCES);
                }
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

impl DedupFs {
    fn allocate_fh(&mut self, path: PathBuf) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.open_handles.insert(fh, OpenHandle { path });
        fh
    }

    /// Shared by `mknod` and `create`'s "doesn't exist yet" branch.
    fn create_entry(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        if self.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);

        self.begin();
        let result = (|| {
            let (parent_tree, _) = self.cache.resolve(&self.meta, &parent_path.to_string_lossy())?;
            let inode = self.meta.insert_inode(NewInode {
                nlinks: 1,
                mode,
                uid: req.uid(),
                gid: req.gid(),
                rdev,
                size: 0,
            })?;
            let tree_id = self.meta.insert_tree(parent_tree, &name.to_string_lossy(), inode)?;
            self.cache
                .insert(&parent_path.to_string_lossy(), &name.to_string_lossy(), tree_id, inode);
            Ok::<u64, DedupError>(inode)
        })();

        match result {
            Ok(inode) => {
                self.commit();
                self.ino_paths.insert(inode, child_path);
                match self.meta.get_inode(inode) {
                    Ok(Some(row)) => reply.entry(&TTL, &Self::to_attr(&row), 0),
                    _ => reply.error(libc::EIO),
                }
            }
            Err(e) => {
                self.rollback();
                reply.error(e.to_errno());
            }
        }
    }

    /// Shared unlink core used by the `unlink` callback and by the
    /// unlink-shaped sub-steps inside `rename`. `rmdir` has its own path
    /// since it additionally has to check the directory is empty before
    /// touching anything.
    fn unlink_entry(&mut self, parent: u64, name: &OsStr) -> Result<(), DedupError> {
        let parent_path = self.path_for(parent).ok_or(DedupError::NoSuchEntry)?;
        let child_path = Self::child_path(&parent_path, name);
        let (_tree_id, inode) = self.cache.resolve(&self.meta, &child_path.to_string_lossy())?;

        let parent_tree = self
            .cache
            .resolve(&self.meta, &parent_path.to_string_lossy())?
            .0;
        self.meta.delete_tree(parent_tree, &name.to_string_lossy())?;
        self.meta.adjust_nlinks(inode, -1)?;
        self.cache
            .invalidate(&parent_path.to_string_lossy(), &name.to_string_lossy());
        self.buffers.remove(&child_path);
        if self.meta.get_inode(inode)?.map(|r| r.nlinks).unwrap_or(0) == 0 {
            self.ino_paths.remove(&inode);
        }
        Ok(())
    }
}

/// `statfs` numbers derived from the host filesystem hosting the
/// metadata store, scaled by the configured `block_size`.
fn host_statvfs(
    options: &Options,
    host_dir: &Path,
) -> Result<(u64, u64, u64, u64, u64, u32, u32, u32), i32> {
    use std::mem::MaybeUninit;
    let path = std::ffi::CString::new(host_dir.to_string_lossy().as_bytes()).unwrap_or_else(|_| {
        std::ffi::CString::new(".").expect("literal \".\" has no interior nul")
    });
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(libc::EIO);
    }
    let stat = unsafe { stat.assume_init() };

    let scale = stat.f_frsize.max(1) as u64;
    let rescale = |blocks: u64| -> u64 { blocks * scale / options.block_size.max(1) as u64 };

    Ok((
        rescale(stat.f_blocks as u64),
        rescale(stat.f_bfree as u64),
        rescale(stat.f_bavail as u64),
        stat.f_files as u64,
        stat.f_ffree as u64,
        options.block_size,
        u32::MAX,
        options.block_size,
    ))
}
