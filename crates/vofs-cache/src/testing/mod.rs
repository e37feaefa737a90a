//! Testing utilities for code built on the cache.
//!
//! - **Memory store**: an in-memory backing store whose [`IoProxy`](crate::IoProxy)
//!   counts calls and can inject failures and latency
//! - **Generators**: block-aware test data (16 KiB boundaries)
//! - **Assertions**: content verification with helpful error messages
//!
//! # Usage
//!
//! ```
//! use vofs_cache::testing::{MemoryStore, patterned_bytes, assert_bytes_equal};
//! use vofs_cache::{Cache, CacheConfig};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let cache = Cache::new(CacheConfig::new(dir.path())).unwrap();
//! let store = MemoryStore::new();
//! store.put("/docs/a.bin", patterned_bytes(40_000));
//!
//! let handle = cache.open("/docs/a.bin", false, true, store.proxy("/docs/a.bin"), false).unwrap();
//! let data = handle.read(0, 40_000).unwrap();
//! assert_bytes_equal(&data, &patterned_bytes(40_000), "first read");
//! handle.release().unwrap();
//! ```

pub mod assertions;
pub mod generators;
pub mod memory;

pub use assertions::{assert_bytes_equal, md5_hex};
pub use generators::{
    BLOCK_SIZE, block_minus_one, block_plus_one, multi_block_content, one_block_content,
    patterned_bytes, random_bytes,
};
pub use memory::{MemoryProxy, MemoryStore};
