//! Error types shared by every storage component.

use std::fmt;

/// Core result type.
pub type DedupResult<T> = Result<T, DedupError>;

/// The seven error kinds the storage engine can raise.
///
/// Mirrors the callback-facing error surface: every variant maps to a
/// negative errno through [`DedupError::to_errno`], the same shape the
/// VFS adapter hands to the kernel bridge.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Path resolution failed, or an operation's target is missing.
    #[error("no such entry")]
    NoSuchEntry,

    /// A permission check against the calling uid/gid failed.
    #[error("permission denied")]
    PermissionDenied,

    /// A mutating operation was attempted on a read-only mount.
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,

    /// `rmdir` on a directory that still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// A name component was invalid (contained a slash, or was empty).
    #[error("invalid name")]
    InvalidName,

    /// Any other operational failure: database error, block-store error,
    /// unexpected I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying metadata store failure.
    #[error("metadata store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Underlying block store failure.
    #[error("block store error: {0}")]
    Sled(#[from] sled::Error),

    /// Hash collision or verify-writes mismatch. Unrecoverable: the
    /// caller is expected to write diagnostics and abort the process,
    /// never to continue serving callbacks.
    #[error("fatal integrity failure: {0}")]
    FatalIntegrity(String),
}

impl DedupError {
    /// Convert to the errno-style code the VFS bridge expects, as a
    /// positive number (the bridge negates it itself).
    pub fn to_errno(&self) -> i32 {
        match self {
            DedupError::NoSuchEntry => libc_enoent(),
            DedupError::PermissionDenied => libc_eacces(),
            DedupError::ReadOnlyFilesystem => libc_erofs(),
            DedupError::NotEmpty => libc_enotempty(),
            DedupError::InvalidName => libc_einval(),
            DedupError::Io(_) => libc_eio(),
            DedupError::Sqlite(_) => libc_eio(),
            DedupError::Sled(_) => libc_eio(),
            DedupError::FatalIntegrity(_) => libc_eio(),
        }
    }

    /// True for the two kinds the design calls "silent by policy":
    /// routine existence/permission failures that should not be logged
    /// at warning level by callers such as `getattr`.
    pub fn is_routine(&self) -> bool {
        matches!(self, DedupError::NoSuchEntry | DedupError::PermissionDenied)
    }
}

// Avoid a hard dependency on `libc` in the core crate: these are the
// fixed Linux errno values the adapter's `reply.error()` calls expect.
fn libc_enoent() -> i32 {
    2
}
fn libc_eacces() -> i32 {
    13
}
fn libc_erofs() -> i32 {
    30
}
fn libc_enotempty() -> i32 {
    39
}
fn libc_einval() -> i32 {
    22
}
fn libc_eio() -> i32 {
    5
}

impl fmt::Display for DiagnosticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to write diagnostics artefact: {}", self.0)
    }
}

/// Wraps an I/O failure encountered while writing a collision/corruption
/// dump, kept distinct from [`DedupError`] so a diagnostics-write
/// failure never masks the integrity failure that triggered it.
#[derive(Debug)]
pub struct DiagnosticsError(pub String);

impl std::error::Error for DiagnosticsError {}
