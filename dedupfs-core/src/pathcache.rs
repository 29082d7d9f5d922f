//! Path resolution cache.
//!
//! A tree of nodes keyed by path segment: each node owns its children
//! outright, so eviction is a simple recursive drop rather than
//! anything involving shared/cyclic references.

use crate::error::{DedupError, DedupResult};
use crate::metastore::{MetaStore, ROOT_INODE, ROOT_TREE_ID};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Injected so tests can advance time deterministically instead of
/// depending on wall-clock flakiness.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheNode {
    tree_id: i64,
    inode: u64,
    last_used: Instant,
    children: HashMap<String, CacheNode>,
}

impl CacheNode {
    fn touch(&mut self, at: Instant) {
        self.last_used = at;
    }
}

/// Default operation-count gate before a sweep is even considered.
pub const DEFAULT_GC_THRESHOLD: u32 = 2500;
/// Default age, in seconds, after which an untouched subtree is evicted.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct PathCache<C: Clock = SystemClock> {
    root: CacheNode,
    requests: u32,
    last_gc: Instant,
    gc_threshold: u32,
    cache_timeout: Duration,
    clock: C,
}

impl PathCache<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for PathCache<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> PathCache<C> {
    pub fn with_clock(clock: C) -> Self {
        let now = clock.now();
        PathCache {
            root: CacheNode {
                tree_id: ROOT_TREE_ID,
                inode: ROOT_INODE,
                last_used: now,
                children: HashMap::new(),
            },
            requests: 0,
            last_gc: now,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            clock,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(clock: C, timeout: Duration, gc_threshold: u32) -> Self {
        let mut cache = Self::with_clock(clock);
        cache.cache_timeout = timeout;
        cache.gc_threshold = gc_threshold;
        cache
    }

    /// Resolves an absolute path (leading `/`, no trailing slash except
    /// for the root itself) to `(tree_id, inode)`, querying `store` on
    /// cache misses and inserting the result. Every traversal step,
    /// including the root, stamps `last_used`.
    pub fn resolve(&mut self, store: &MetaStore, path: &str) -> DedupResult<(i64, u64)> {
        let now = self.clock.now();
        self.root.touch(now);

        if path == "/" || path.is_empty() {
            self.maybe_sweep(now);
            return Ok((self.root.tree_id, self.root.inode));
        }

        let mut node = &mut self.root;
        for segment in path.trim_start_matches('/').split('/') {
            if segment.is_empty() {
                continue;
            }
            if !node.children.contains_key(segment) {
                let (tree_id, inode) = store
                    .resolve_child(node.tree_id, segment)?
                    .ok_or(DedupError::NoSuchEntry)?;
                node.children.insert(
                    segment.to_string(),
                    CacheNode {
                        tree_id,
                        inode,
                        last_used: now,
                        children: HashMap::new(),
                    },
                );
            }
            let child = node.children.get_mut(segment).unwrap();
            child.touch(now);
            node = child;
        }

        let result = (node.tree_id, node.inode);
        self.maybe_sweep(now);
        Ok(result)
    }

    /// Records that `name` under `parent` (identified by the cached
    /// parent's `tree_id`, obtained from a prior `resolve`) now maps to
    /// `(tree_id, inode)`, called after a successful `create`/`mkdir`/
    /// `mknod`/`symlink`/`link` so the new entry is visible to the next
    /// resolution without a store round-trip.
    pub fn insert(&mut self, parent_path: &str, name: &str, tree_id: i64, inode: u64) {
        if let Some(parent) = self.find_node_mut(parent_path) {
            let now = self.clock.now();
            parent.children.insert(
                name.to_string(),
                CacheNode {
                    tree_id,
                    inode,
                    last_used: now,
                    children: HashMap::new(),
                },
            );
        }
    }

    /// Removes a single cached child, called after `unlink`/`rmdir`/the
    /// two `unlink`-shaped sub-steps of `rename`.
    pub fn invalidate(&mut self, parent_path: &str, name: &str) {
        if let Some(parent) = self.find_node_mut(parent_path) {
            parent.children.remove(name);
        }
    }

    fn find_node_mut(&mut self, path: &str) -> Option<&mut CacheNode> {
        if path == "/" || path.is_empty() {
            return Some(&mut self.root);
        }
        let mut node = &mut self.root;
        for segment in path.trim_start_matches('/').split('/') {
            if segment.is_empty() {
                continue;
            }
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    fn maybe_sweep(&mut self, now: Instant) {
        self.requests += 1;
        if self.requests < self.gc_threshold {
            return;
        }
        if now.duration_since(self.last_gc) < self.cache_timeout {
            return;
        }
        self.requests = 0;
        self.last_gc = now;
        sweep(&mut self.root, now, self.cache_timeout);
    }
}

/// Recursively drops any child whose `last_used` predates `timeout`,
/// and descends into survivors to do the same to their children.
fn sweep(node: &mut CacheNode, now: Instant, timeout: Duration) {
    node.children
        .retain(|_, child| now.duration_since(child.last_used) < timeout);
    for child in node.children.values_mut() {
        sweep(child, now, timeout);
    }
}
