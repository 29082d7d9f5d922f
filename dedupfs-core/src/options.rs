//! The immutable, persisted create-time settings, and the
//! conflict-reconciliation policy applied on re-open.
//!
//! Schema creation itself lives in [`crate::metastore`], which owns the
//! connection; this module is the pure policy piece so it can be unit
//! tested without a database.

use crate::compress::CompressionMethod;
use crate::hash::HashAlgorithm;

/// Create-time immutable settings, persisted in the `options` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub block_size: u32,
    pub hash_function: HashAlgorithm,
    pub compression_method: CompressionMethod,
    pub synchronous: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            block_size: 131_072,
            hash_function: HashAlgorithm::default(),
            compression_method: CompressionMethod::default(),
            synchronous: true,
        }
    }
}

/// A warning to surface to the user (and the log) when a CLI-requested
/// option conflicts with what is already persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionConflict {
    pub name: &'static str,
    pub requested: String,
    pub persisted: String,
}

/// Reconciles CLI-requested options against options already persisted
/// from a prior run. `block_size`, `hash_function`, and
/// `compression_method` are create-time immutable (invariant 5): any
/// conflict there is overridden silently in favour of the persisted
/// value, with a warning returned for the caller to log.
///
/// `synchronous` is *not* create-time immutable — it is a durability
/// knob the user may freely change on each mount — so the requested
/// value always wins for that field.
pub fn reconcile(requested: Options, persisted: Options) -> (Options, Vec<OptionConflict>) {
    let mut conflicts = Vec::new();

    if requested.block_size != persisted.block_size {
        conflicts.push(OptionConflict {
            name: "block_size",
            requested: requested.block_size.to_string(),
            persisted: persisted.block_size.to_string(),
        });
    }
    if requested.hash_function != persisted.hash_function {
        conflicts.push(OptionConflict {
            name: "hash_function",
            requested: requested.hash_function.as_str().to_string(),
            persisted: persisted.hash_function.as_str().to_string(),
        });
    }
    if requested.compression_method != persisted.compression_method {
        conflicts.push(OptionConflict {
            name: "compression_method",
            requested: requested.compression_method.as_str().to_string(),
            persisted: persisted.compression_method.as_str().to_string(),
        });
    }

    let resolved = Options {
        block_size: persisted.block_size,
        hash_function: persisted.hash_function,
        compression_method: persisted.compression_method,
        synchronous: requested.synchronous,
    };

    (resolved, conflicts)
}

/// Runtime-only flags: never persisted, freely changed per mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub use_transactions: bool,
    pub gc_enabled: bool,
    pub verify_writes: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            use_transactions: true,
            gc_enabled: true,
            verify_writes: false,
        }
    }
}
