#![forbid(unsafe_code)]
//! Error types for arcfs.
//!
//! Defines `ArcError` and a `Result<T>` alias used throughout the
//! workspace. Every per-operation failure ultimately surfaces as a
//! negative errno-style integer in a request's result slot; `to_errno`
//! and `to_result` provide that mapping.

use thiserror::Error;

/// Unified error type for mount and overlay operations.
#[derive(Debug, Error)]
pub enum ArcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("archive invalid: {0}")]
    ArchiveInvalid(String),

    #[error("failed to create cache directory: {0}")]
    FailedToCreateCache(String),

    #[error("archive already mounted at {0}")]
    AlreadyMounted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("bad descriptor: {0}")]
    BadDescriptor(i64),

    #[error("cache file unavailable for entry: {0}")]
    CacheUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ArcError {
    /// Convert this error into a positive POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ArchiveNotFound(_) | Self::NotFound(_) => libc::ENOENT,
            Self::ArchiveInvalid(_) | Self::CacheUnavailable(_) => libc::EIO,
            Self::FailedToCreateCache(_) => libc::EACCES,
            Self::AlreadyMounted(_) => libc::EBUSY,
            Self::NotDirectory => libc::ENOTDIR,
            Self::BadDescriptor(_) => libc::EBADF,
            Self::Cancelled => libc::ECANCELED,
        }
    }

    /// The errno-style operation result for this error (negative).
    #[must_use]
    pub fn to_result(&self) -> i64 {
        -i64::from(self.to_errno())
    }
}

/// Map an `io::Error` to a negative errno-style result.
#[must_use]
pub fn errno_result(err: &std::io::Error) -> i64 {
    match err.raw_os_error() {
        Some(code) => -i64::from(code),
        None => -i64::from(libc::EIO),
    }
}

/// Result alias using `ArcError`.
pub type Result<T> = std::result::Result<T, ArcError>;
