//! Cache configuration.
//!
//! [`CacheConfig`] carries the cache root, the size ceiling, the per-call
//! deadline and the flush pool size. It deserializes from the same kind of
//! JSON/TOML document the rest of a mount configuration lives in, with
//! durations written in humantime form (`"60s"`, `"500ms"`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Granularity of the residency bitmap, in bytes.
pub const IO_BLOCK_SIZE: u64 = 16 * 1024;

/// MD5 of the empty byte string. Used as the checksum of freshly created files.
pub const ZERO_LENGTH_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Subdirectory of the cache root holding file content.
pub const DATA_SUBDIR: &str = "data";

/// Subdirectory of the cache root holding persisted metadata.
pub const METADATA_SUBDIR: &str = "metaData";

/// Default ceiling on cached content (1 GiB).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 1024 * 1024 * 1024;

/// Default deadline for a blocking cache wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of flush worker threads.
pub const DEFAULT_FLUSH_THREADS: usize = 10;

/// Default forward-continuation allowance for extending an in-flight read
/// instead of starting a new one (512 KiB).
pub const DEFAULT_READ_CONTINUE_MAX: u64 = 512 * 1024;

/// Configuration for a [`Cache`](crate::Cache).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory. `data/` and `metaData/` are created beneath it.
    pub cache_dir: PathBuf,

    /// Eviction starts once cached content exceeds this many bytes.
    pub max_cache_size: u64,

    /// Refuse to create new files.
    pub read_only: bool,

    /// How long a single operation may block before it fails with
    /// [`CacheError::Retry`](crate::CacheError::Retry). `None` waits forever.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Number of flush worker threads.
    pub max_flush_threads: usize,

    /// How far past the progress of an in-flight read a new request may
    /// start and still be served by extending that read.
    pub read_continue_max: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("vofs-cache"),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            read_only: false,
            timeout: Some(DEFAULT_TIMEOUT),
            max_flush_threads: DEFAULT_FLUSH_THREADS,
            read_continue_max: DEFAULT_READ_CONTINUE_MAX,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration rooted at `cache_dir` with default limits.
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Sets the size ceiling in bytes.
    #[must_use]
    pub fn max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Marks the cache read-only.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the per-operation wait deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the flush pool size. Zero is bumped to one.
    #[must_use]
    pub fn max_flush_threads(mut self, threads: usize) -> Self {
        self.max_flush_threads = threads.max(1);
        self
    }

    /// Sets the read continuation allowance.
    #[must_use]
    pub fn read_continue_max(mut self, bytes: u64) -> Self {
        self.read_continue_max = bytes;
        self
    }

    /// `<cache_dir>/data`
    pub fn data_dir(&self) -> PathBuf {
        self.cache_dir.join(DATA_SUBDIR)
    }

    /// `<cache_dir>/metaData`
    pub fn metadata_dir(&self) -> PathBuf {
        self.cache_dir.join(METADATA_SUBDIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_cache_size, 1024 * 1024 * 1024);
        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_flush_threads, 10);
        assert_eq!(config.read_continue_max, 512 * 1024);
        assert!(!config.read_only);
    }

    #[test]
    fn test_builder_pattern() {
        let config = CacheConfig::new("/tmp/c")
            .max_cache_size(4096)
            .read_only(true)
            .timeout(None)
            .max_flush_threads(0)
            .read_continue_max(1);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/c"));
        assert_eq!(config.max_cache_size, 4096);
        assert!(config.read_only);
        assert_eq!(config.timeout, None);
        assert_eq!(config.max_flush_threads, 1);
        assert_eq!(config.read_continue_max, 1);
    }

    #[test]
    fn test_subdirectories() {
        let config = CacheConfig::new("/var/cache/vofs");
        assert_eq!(config.data_dir(), PathBuf::from("/var/cache/vofs/data"));
        assert_eq!(
            config.metadata_dir(),
            PathBuf::from("/var/cache/vofs/metaData")
        );
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = r#"{"cache_dir": "/c", "timeout": "250ms", "max_cache_size": 10}"#;
        let config: CacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_cache_size, 10);
        assert_eq!(config.max_flush_threads, DEFAULT_FLUSH_THREADS);
    }

    #[test]
    fn test_serialize_round_trip_keeps_timeout() {
        let config = CacheConfig::new("/c").timeout(Some(Duration::from_secs(5)));
        let json = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout, Some(Duration::from_secs(5)));
    }
}
