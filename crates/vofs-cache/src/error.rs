//! Error types for the cache layer.
//!
//! Every fallible operation in this crate returns a [`CacheError`]. The
//! variants follow the failure classes a caller has to tell apart:
//!
//! - [`CacheError::Retry`] - a wait exceeded the configured deadline. The
//!   operation did not fail and no data was lost; resubmit it.
//! - [`CacheError::NotFound`] / [`CacheError::Backing`] - the backing store
//!   reported a failure, possibly captured on a background thread and
//!   surfaced by the next synchronous call that needed the result.
//! - [`CacheError::Busy`] - a flush was requested while other opens of the
//!   same path are still live.
//! - [`CacheError::Consistency`] - a broken cache invariant. Never retried.
//!
//! Errors are `Clone` so that a failure captured by a read task or a flush
//! worker can be stored on the file handle and handed to every caller that
//! asks for it, unchanged.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by the cache and by [`IoProxy`](crate::IoProxy)
/// implementations.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A wait timed out. The caller must resubmit the operation.
    #[error("Cache operation timed out, retry: {0}")]
    Retry(String),

    /// The remote object does not exist.
    #[error("Remote object not found: {0}")]
    NotFound(String),

    /// The backing store failed a read, upload or delete.
    #[error("Backing store error: {0}")]
    Backing(String),

    /// The handle is referenced by more than one open.
    #[error("File handle busy: {0}")]
    Busy(String),

    /// A cache invariant was violated (misaligned block write, write past
    /// the known size, lock misuse).
    #[error("Cache consistency error: {0}")]
    Consistency(String),

    /// A create was attempted on a read-only cache.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The path is not absolute or escapes the cache root.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A read task was told to stop. Backing-store implementations should
    /// propagate this out of `read_from_backing` unchanged.
    #[error("Read to cache aborted")]
    Aborted,

    /// The flush queue has been shut down.
    #[error("Flush queue is shut down")]
    ShutDown,

    /// Local filesystem error on the cache directories or descriptor.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Build a [`CacheError::Consistency`] from anything displayable.
    pub fn consistency(msg: impl Into<String>) -> Self {
        CacheError::Consistency(msg.into())
    }

    /// Build a [`CacheError::Backing`] from anything displayable.
    pub fn backing(msg: impl Into<String>) -> Self {
        CacheError::Backing(msg.into())
    }

    /// Whether the caller should resubmit the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Retry(_))
    }

    /// Whether the error reports a missing remote object (or a missing
    /// local file).
    pub fn is_not_found(&self) -> bool {
        match self {
            CacheError::NotFound(_) => true,
            CacheError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Converts this error to a libc error code for the operation surface.
    pub fn to_errno(&self) -> i32 {
        match self {
            CacheError::Retry(_) => libc::EAGAIN,
            CacheError::NotFound(_) => libc::ENOENT,
            CacheError::Busy(_) => libc::EBUSY,
            CacheError::PermissionDenied(_) => libc::EPERM,
            CacheError::InvalidPath(_) => libc::EINVAL,
            CacheError::Aborted => libc::EINTR,
            CacheError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            CacheError::Backing(_) | CacheError::Consistency(_) | CacheError::ShutDown => {
                libc::EIO
            }
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        CacheError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Io(Arc::new(io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(CacheError::Retry("wait".into()).to_errno(), libc::EAGAIN);
        assert_eq!(CacheError::Busy("/a".into()).to_errno(), libc::EBUSY);
        assert_eq!(CacheError::NotFound("/a".into()).to_errno(), libc::ENOENT);
        assert_eq!(
            CacheError::PermissionDenied("ro".into()).to_errno(),
            libc::EPERM
        );
        assert_eq!(CacheError::InvalidPath("a".into()).to_errno(), libc::EINVAL);
        assert_eq!(CacheError::consistency("gap").to_errno(), libc::EIO);
        assert_eq!(CacheError::backing("500").to_errno(), libc::EIO);
    }

    #[test]
    fn test_io_error_passthrough() {
        let e: CacheError = io::Error::from_raw_os_error(libc::ENOSPC).into();
        assert_eq!(e.to_errno(), libc::ENOSPC);

        let e: CacheError = io::Error::other("custom").into();
        assert_eq!(e.to_errno(), libc::EIO);
    }

    #[test]
    fn test_only_retry_is_retryable() {
        assert!(CacheError::Retry("x".into()).is_retryable());
        assert!(!CacheError::Busy("x".into()).is_retryable());
        assert!(!CacheError::consistency("x").is_retryable());
        assert!(!CacheError::Aborted.is_retryable());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(CacheError::NotFound("/x".into()).is_not_found());
        let io: CacheError = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(io.is_not_found());
        assert!(!CacheError::backing("x").is_not_found());
    }

    #[test]
    fn test_clone_keeps_message() {
        let e = CacheError::backing("upload rejected: 507");
        let cloned = e.clone();
        assert_eq!(e.to_string(), cloned.to_string());
        assert!(cloned.to_string().contains("507"));
    }
}
