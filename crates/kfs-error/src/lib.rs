#![forbid(unsafe_code)]
//! Error types for kfs.
//!
//! # Error Taxonomy
//!
//! kfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `kfs-types` | On-disk format violations detected during byte decoding |
//! | Runtime | `KfsError` | `kfs-error` (this crate) | Errors surfaced to FUSE, CLI and library callers |
//!
//! ## ParseError → KfsError
//!
//! A decode failure on live metadata means the image is damaged, so the
//! blanket `From<ParseError>` produces `Corruption` with block 0. Code that
//! knows which block it was decoding uses [`KfsError::corrupt_at`] instead.
//! Mount-time validation in `kfs-core` maps field failures onto
//! `InvalidGeometry` / `UnsupportedFeature` / `Format` explicitly.
//!
//! ## FUSE errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`KfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS errno, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format`, `Parse`, `InvalidGeometry`, `InvalidArgument` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `NoSpace`, `DirectoryFull` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `PermissionDenied` | `EACCES` |
//! | `NotPermitted` | `EPERM` |
//! | `ReadOnly` | `EROFS` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `TooManyLinks` | `EMLINK` |
//!
//! Nothing in kfs retries on error: each failure is returned once, to the
//! caller of the operation that hit it.

use kfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all kfs operations.
#[derive(Debug, Error)]
pub enum KfsError {
    /// Operating system I/O error, including short reads and writes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata violates an invariant (bad extent magic, a directory
    /// block without its tail sentinel, a group index out of range).
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not a usable ext4 filesystem.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced verbatim.
    #[error("parse error: {0}")]
    Parse(String),

    /// The image or the request needs a feature this build does not handle.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Superblock geometry is out of range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The bitmap allocator found no free inode or block in any group.
    #[error("no space left on device")]
    NoSpace,

    /// A directory could not take another entry and could not grow.
    #[error("no space for entry in directory {0}")]
    DirectoryFull(u64),

    /// Path component or directory entry absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Permission bits deny the requested access.
    #[error("permission denied")]
    PermissionDenied,

    /// Operation not permitted on this kind of object (hard link to a directory).
    #[error("operation not permitted")]
    NotPermitted,

    /// Filesystem is mounted read-only and a write was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Filename exceeds 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists.
    #[error("file exists")]
    Exists,

    /// Argument invalid for the target (readlink on a regular file, rename into own subtree).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Link count would overflow.
    #[error("too many links")]
    TooManyLinks,
}

impl KfsError {
    /// Build a `Corruption` error tagged with the block being decoded.
    #[must_use]
    pub fn corrupt_at(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NoSpace | Self::DirectoryFull(_) => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotPermitted => libc::EPERM,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::TooManyLinks => libc::EMLINK,
        }
    }
}

impl From<ParseError> for KfsError {
    fn from(err: ParseError) -> Self {
        Self::Corruption {
            block: 0,
            detail: err.to_string(),
        }
    }
}

/// Result alias using `KfsError`.
pub type Result<T> = std::result::Result<T, KfsError>;
