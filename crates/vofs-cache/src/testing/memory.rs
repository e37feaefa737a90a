//! In-memory backing store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};
use crate::io_proxy::{CacheReader, CacheWriter, IoProxy};
use crate::testing::md5_hex;

#[derive(Debug, Default)]
struct StoreInner {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    reads: AtomicU64,
    uploads: AtomicU64,
    deletes: AtomicU64,
    fail_reads: Mutex<Option<CacheError>>,
    fail_uploads: Mutex<Option<CacheError>>,
    fail_reads_from: Mutex<Option<(u64, CacheError)>>,
    read_latency: Mutex<Option<Duration>>,
}

/// Object store held in memory, shared by every proxy it hands out.
///
/// Checksums are hex MD5 of the object content.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` at `path`.
    pub fn put(&self, path: &str, data: Vec<u8>) {
        self.inner.objects.lock().insert(path.to_owned(), data);
    }

    /// Content stored at `path`.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.objects.lock().get(path).cloned()
    }

    /// Whether `path` exists.
    pub fn contains(&self, path: &str) -> bool {
        self.inner.objects.lock().contains_key(path)
    }

    /// Delete `path` directly, bypassing the counters.
    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.objects.lock().remove(path)
    }

    /// Proxy bound to `path`.
    pub fn proxy(&self, path: &str) -> Box<dyn IoProxy> {
        Box::new(MemoryProxy {
            store: self.clone(),
            path: path.to_owned(),
        })
    }

    /// Calls to `read_from_backing`.
    pub fn read_count(&self) -> u64 {
        self.inner.reads.load(Ordering::SeqCst)
    }

    /// Calls to `write_to_backing`.
    pub fn upload_count(&self) -> u64 {
        self.inner.uploads.load(Ordering::SeqCst)
    }

    /// Calls to `delete_remote`.
    pub fn delete_count(&self) -> u64 {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    /// Make every download fail with `error` (`None` to stop).
    pub fn fail_reads(&self, error: Option<CacheError>) {
        *self.inner.fail_reads.lock() = error;
    }

    /// Make downloads fail with the given error when they reach the given
    /// offset, after delivering the header and every block before it
    /// (`None` to stop).
    pub fn fail_reads_from(&self, failure: Option<(u64, CacheError)>) {
        *self.inner.fail_reads_from.lock() = failure;
    }

    /// Make every upload fail with `error` (`None` to stop).
    pub fn fail_uploads(&self, error: Option<CacheError>) {
        *self.inner.fail_uploads.lock() = error;
    }

    /// Sleep this long before the header and before each block of a download.
    pub fn set_read_latency(&self, latency: Option<Duration>) {
        *self.inner.read_latency.lock() = latency;
    }

    fn pause(&self) {
        let latency = *self.inner.read_latency.lock();
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
    }
}

/// [`IoProxy`] for one path of a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryProxy {
    store: MemoryStore,
    path: String,
}

impl MemoryProxy {
    fn object(&self) -> CacheResult<Vec<u8>> {
        self.store
            .get(&self.path)
            .ok_or_else(|| CacheError::NotFound(self.path.clone()))
    }
}

impl IoProxy for MemoryProxy {
    fn size(&self) -> CacheResult<u64> {
        Ok(self.object()?.len() as u64)
    }

    fn checksum(&self) -> CacheResult<String> {
        Ok(md5_hex(&self.object()?))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_from_backing(
        &self,
        writer: &mut CacheWriter<'_>,
        size: Option<u64>,
        offset: u64,
        block_size: u64,
    ) -> CacheResult<()> {
        self.store.inner.reads.fetch_add(1, Ordering::SeqCst);
        self.store.pause();
        let injected = self.store.inner.fail_reads.lock().clone();
        if let Some(e) = injected {
            return Err(e);
        }

        let data = self.object()?;
        let len = data.len() as u64;
        writer.set_header(len, &md5_hex(&data))?;

        let end = size.map_or(len, |s| offset.saturating_add(s).min(len));
        let mut pos = offset;
        while pos < end {
            self.store.pause();
            let injected = self.store.inner.fail_reads_from.lock().clone();
            if let Some((from, e)) = injected {
                if pos >= from {
                    return Err(e);
                }
            }
            let next = ((pos / block_size + 1) * block_size).min(end);
            writer.write_block(&data[pos as usize..next as usize], pos)?;
            pos = next;
        }
        Ok(())
    }

    fn write_to_backing(&self, reader: &mut CacheReader<'_>) -> CacheResult<String> {
        self.store.inner.uploads.fetch_add(1, Ordering::SeqCst);
        let injected = self.store.inner.fail_uploads.lock().clone();
        if let Some(e) = injected {
            return Err(e);
        }
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let checksum = md5_hex(&data);
        self.store.put(&self.path, data);
        Ok(checksum)
    }

    fn delete_remote(&self, force: bool) -> CacheResult<()> {
        self.store.inner.deletes.fetch_add(1, Ordering::SeqCst);
        if self.store.remove(&self.path).is_none() && !force {
            return Err(CacheError::NotFound(self.path.clone()));
        }
        Ok(())
    }
}
