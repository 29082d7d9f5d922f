//! Storage engine behind DedupFS: a content-addressed, deduplicating,
//! optionally-compressing block store with a POSIX-shaped metadata
//! layer on top. This crate has no knowledge of the kernel filesystem
//! bridge; it exposes the primitives a VFS adapter drives.

pub mod blockstore;
pub mod compress;
pub mod error;
pub mod gc;
pub mod hash;
pub mod metastore;
pub mod options;
pub mod pathcache;
pub mod stats;
pub mod writebuf;

pub use error::{DedupError, DedupResult};
