#![allow(dead_code)] // Not every test binary uses every helper

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use vofs_cache::testing::{MemoryStore, md5_hex};
use vofs_cache::{Cache, CacheConfig, CacheMetaData, CacheResult, FileHandle};

/// Install a test-writer subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A cache in a temporary directory plus the memory store behind it.
pub struct Fixture {
    pub dir: TempDir,
    pub cache: Cache,
    pub store: MemoryStore,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|c| c)
    }

    pub fn with_config(configure: impl FnOnce(CacheConfig) -> CacheConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = configure(CacheConfig::new(dir.path().join("cache")).max_flush_threads(2));
        let cache = Cache::new(config).expect("Failed to create cache");
        Self {
            dir,
            cache,
            store: MemoryStore::new(),
        }
    }

    /// Open `path` with a proxy onto the fixture's store.
    pub fn open(
        &self,
        path: &str,
        is_new: bool,
        must_exist: bool,
        trust_metadata: bool,
    ) -> CacheResult<Arc<FileHandle>> {
        self.cache
            .open(path, is_new, must_exist, self.store.proxy(path), trust_metadata)
    }

    /// Create `path`, write `content` and release it (uploading it).
    pub fn create_file(&self, path: &str, content: &[u8]) {
        let handle = self.open(path, true, false, false).expect("Failed to create");
        handle.write(content, 0).expect("Failed to write");
        handle.release().expect("Failed to release");
    }

    pub fn data_file(&self, path: &str) -> PathBuf {
        self.cache.data_dir().join(path.trim_start_matches('/'))
    }

    pub fn meta_file(&self, path: &str) -> PathBuf {
        self.cache.metadata_dir().join(path.trim_start_matches('/'))
    }

    /// Place a fully cached copy of `content` directly in the cache
    /// directories and the store, as a previous session would have left it.
    pub fn seed_cached(&self, path: &str, content: &[u8]) {
        let data = self.data_file(path);
        std::fs::create_dir_all(data.parent().unwrap()).unwrap();
        std::fs::write(&data, content).unwrap();
        CacheMetaData::fully_resident(content.len() as u64, md5_hex(content))
            .persist(&self.meta_file(path))
            .unwrap();
        self.store.put(path, content.to_vec());
    }

    /// Put `content` in the store and leave a residency record with no block
    /// resident. Opened with trusted metadata, every byte is fetched on
    /// demand.
    pub fn seed_uncached(&self, path: &str, content: &[u8]) {
        self.store.put(path, content.to_vec());
        CacheMetaData::new(content.len() as u64, md5_hex(content))
            .persist(&self.meta_file(path))
            .unwrap();
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}
