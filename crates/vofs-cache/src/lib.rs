//! Disk-backed sparse cache for a remote object store.
//!
//! Remote files are mirrored into a local cache directory block by block
//! (16 KiB) as they are read. Writes land locally and are uploaded when the
//! last opener flushes or releases the file. The cache directory is bounded
//! by an LRU eviction pass over files nobody has open.
//!
//! # Components
//!
//! - [`Cache`] - The cache directory, its registry of open files and its
//!   flush workers
//! - [`FileHandle`] - One cached remote file, shared by all its opens
//! - [`IoProxy`] - Trait the caller implements to reach the backing store
//! - [`CacheMetaData`] - Persisted size, checksum and residency bitmap
//! - [`SharedLock`] - Reader/writer lock whose exclusive side can be handed
//!   to a flush worker
//! - [`CacheCondition`] - Deadline-bounded wait on a handle's state lock
//! - [`FlushQueue`] - FIFO pool of upload workers
//! - [`ReadTask`] - Background fetch of a byte range
//!
//! # Concurrency
//!
//! Everything is plain threads. Each read task runs on its own thread; each
//! flush runs on one of `max_flush_threads` workers. Callers block on the
//! handle's condition, bounded by [`CacheConfig::timeout`]; running out of
//! time returns [`CacheError::Retry`] and leaves the background work going.
//!
//! # Example
//!
//! ```
//! use vofs_cache::{Cache, CacheConfig};
//! use vofs_cache::testing::MemoryStore;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let cache = Cache::new(CacheConfig::new(dir.path()).max_flush_threads(2)).unwrap();
//! let store = MemoryStore::new();
//!
//! // Create, write, and upload on release.
//! let handle = cache.open("/notes.txt", true, false, store.proxy("/notes.txt"), false).unwrap();
//! handle.write(b"hello", 0).unwrap();
//! handle.release().unwrap();
//! assert_eq!(store.get("/notes.txt").unwrap(), b"hello");
//! ```

#![warn(missing_docs)]

pub mod cache;
pub mod condition;
pub mod config;
pub mod error;
pub mod file_handle;
pub mod flush_queue;
pub mod io_proxy;
pub mod metadata;
pub mod read_thread;
pub mod registry;
pub mod shared_lock;
pub mod stats;

/// Testing utilities for code built on the cache.
///
/// Provides an in-memory backing store, block-aware data generators and
/// content assertions.
pub mod testing;

pub use cache::{Cache, CacheUsage, FileAttr};
pub use condition::CacheCondition;
pub use config::{CacheConfig, IO_BLOCK_SIZE, ZERO_LENGTH_MD5};
pub use error::{CacheError, CacheResult};
pub use file_handle::{CacheStatus, FileHandle};
pub use flush_queue::{FlushQueue, Flushable};
pub use io_proxy::{CacheReader, CacheWriter, IoProxy};
pub use metadata::CacheMetaData;
pub use read_thread::ReadTask;
pub use shared_lock::{LockOwner, SharedLock, WorkerId};
pub use stats::{CacheStats, CacheStatsSnapshot};
