//! Per-path cache state machine.
//!
//! A [`FileHandle`] owns the cache file descriptor for one remote path, its
//! residency metadata, at most one background [`ReadTask`] and at most one
//! queued flush. It is shared by every concurrent open of the path and
//! reference counted by those opens (plus one reference held by a queued
//! flush).
//!
//! # Locks
//!
//! Acquired in this order, never the reverse:
//!
//! 1. the cache registry lock (owned by [`Cache`](crate::Cache))
//! 2. `state`, the per-file lock; [`CacheCondition`] waits release it
//! 3. `fd`, the descriptor lock
//!
//! The writer lock ([`SharedLock`]) is taken before `state`: shared by
//! `write`, exclusive by `truncate` and by a flush from the moment it is
//! queued until the upload worker releases it.
//!
//! # Errors
//!
//! A read task that fails stores its error on the handle. The next `read`,
//! `write`, `truncate` or `flush` returns it, as does any call that waits on
//! data the task did not deliver. A flush failure is returned to the caller
//! waiting in [`FileHandle::flush`].

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, error, instrument, trace, warn};

use crate::cache::CacheShared;
use crate::condition::CacheCondition;
use crate::config::{IO_BLOCK_SIZE, ZERO_LENGTH_MD5};
use crate::error::{CacheError, CacheResult};
use crate::flush_queue::Flushable;
use crate::io_proxy::{CacheReader, IoProxy};
use crate::metadata::{CacheMetaData, block_info};
use crate::read_thread::{self, ReadTask};
use crate::shared_lock::{LockOwner, SharedLock, WorkerId};
use crate::stats::CacheStats;

/// How much of the file is known to be local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Freshly created handle, nothing decided yet.
    Unknown,
    /// Some blocks may be missing; consult the residency bitmap.
    Partial,
    /// Every byte of the file is in the cache file.
    Full,
}

/// Mutable per-file state, guarded by the handle's `state` lock.
#[derive(Debug)]
pub(crate) struct FileState {
    pub(crate) path: String,
    pub(crate) data_path: PathBuf,
    pub(crate) meta_path: PathBuf,
    pub(crate) ref_count: usize,
    pub(crate) modified: bool,
    pub(crate) status: CacheStatus,
    pub(crate) metadata: Option<CacheMetaData>,
    pub(crate) obsolete: bool,
    pub(crate) flush_queued: bool,
    pub(crate) flush_error: Option<CacheError>,
    pub(crate) read_error: Option<CacheError>,
    pub(crate) read_task: Option<ReadTask>,
    pub(crate) got_header: bool,
    pub(crate) file_size: Option<u64>,
    next_task_id: u64,
}

impl FileState {
    fn new(path: &str, data_path: PathBuf, meta_path: PathBuf) -> Self {
        Self {
            path: path.to_owned(),
            data_path,
            meta_path,
            ref_count: 0,
            modified: false,
            status: CacheStatus::Unknown,
            metadata: None,
            obsolete: false,
            flush_queued: false,
            flush_error: None,
            read_error: None,
            read_task: None,
            got_header: false,
            file_size: None,
            next_task_id: 0,
        }
    }

    /// Opens other than the reference a queued flush holds.
    fn open_refs(&self) -> usize {
        self.ref_count.saturating_sub(usize::from(self.flush_queued))
    }

    /// The local content became authoritative at `size` bytes.
    fn mark_local_size(&mut self, size: u64) {
        self.file_size = Some(size);
        match self.metadata.as_mut() {
            Some(meta) => meta.resize_all_resident(size),
            None => self.metadata = Some(CacheMetaData::fully_resident(size, "")),
        }
        self.status = CacheStatus::Full;
    }
}

/// Cached view of one remote file.
pub struct FileHandle {
    cache: Arc<CacheShared>,
    proxy: Box<dyn IoProxy>,
    pub(crate) state: Mutex<FileState>,
    pub(crate) cond: CacheCondition,
    fd: Mutex<Option<File>>,
    writer_lock: SharedLock,
}

impl FileHandle {
    pub(crate) fn new(
        cache: Arc<CacheShared>,
        path: &str,
        proxy: Box<dyn IoProxy>,
    ) -> CacheResult<Self> {
        let data_path = cache.data_path(path);
        let meta_path = cache.meta_path(path);
        if let Some(parent) = data_path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&data_path)?;
        let cond = CacheCondition::new(cache.config.timeout);

        Ok(Self {
            cache,
            proxy,
            state: Mutex::new(FileState::new(path, data_path, meta_path)),
            cond,
            fd: Mutex::new(Some(file)),
            writer_lock: SharedLock::new(),
        })
    }

    /// Remote path this handle caches.
    pub fn path(&self) -> String {
        self.state.lock().path.clone()
    }

    /// Location of the cache file.
    pub fn data_path(&self) -> PathBuf {
        self.state.lock().data_path.clone()
    }

    /// Number of live references (opens plus a queued flush).
    pub fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }

    /// Whether every byte of the file is local.
    pub fn is_fully_cached(&self) -> bool {
        self.state.lock().status == CacheStatus::Full
    }

    /// Cache status.
    pub fn status(&self) -> CacheStatus {
        self.state.lock().status
    }

    /// Whether the local copy has changes not yet uploaded.
    pub fn is_modified(&self) -> bool {
        self.state.lock().modified
    }

    /// Whether this handle has been superseded by a create, unlink or rename.
    pub fn is_obsolete(&self) -> bool {
        self.state.lock().obsolete
    }

    /// Current file size, if known.
    pub fn file_size(&self) -> Option<u64> {
        self.state.lock().file_size
    }

    /// Whether a read task is running.
    pub fn has_read_task(&self) -> bool {
        self.state.lock().read_task.is_some()
    }

    /// Copy of the residency metadata.
    pub fn metadata(&self) -> Option<CacheMetaData> {
        self.state.lock().metadata.clone()
    }

    pub(crate) fn proxy(&self) -> &dyn IoProxy {
        self.proxy.as_ref()
    }

    pub(crate) fn stats(&self) -> &CacheStats {
        &self.cache.stats
    }

    /// Run `f` on the open cache file with the descriptor lock held.
    pub(crate) fn with_fd<R>(&self, f: impl FnOnce(&File) -> io::Result<R>) -> CacheResult<R> {
        let guard = self.fd.lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| CacheError::consistency("cache file descriptor is closed"))?;
        Ok(f(file)?)
    }

    /// Read up to `size` bytes at `offset`, fetching missing blocks first.
    ///
    /// Returns fewer bytes at end of file. Fails with
    /// [`CacheError::Retry`] if the data does not arrive before the deadline.
    pub fn read(self: &Arc<Self>, offset: u64, size: usize) -> CacheResult<Vec<u8>> {
        let deadline = self.cond.deadline();
        let want = {
            let mut state = self.state.lock();
            take_read_error(&mut state)?;
            self.make_cached(&mut state, offset, size as u64, deadline)?;
            match state.file_size {
                Some(file_size) => {
                    let left = file_size.saturating_sub(offset);
                    size.min(usize::try_from(left).unwrap_or(usize::MAX))
                }
                None => size,
            }
        };

        let mut buf = vec![0u8; want];
        let n = self.with_fd(|f| read_full_at(f, &mut buf, offset))?;
        buf.truncate(n);
        trace!(offset, requested = size, returned = n, "Read from cache");
        Ok(buf)
    }

    /// Write `data` at `offset`.
    ///
    /// The existing content is made fully local first so the file never has
    /// holes the flush would upload as zeros, and any read task is stopped
    /// so no backing-store data lands over the new bytes.
    pub fn write(self: &Arc<Self>, data: &[u8], offset: u64) -> CacheResult<usize> {
        let deadline = self.cond.deadline();
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| CacheError::InvalidPath(format!("write at offset {offset} overflows")))?;
        take_read_error(&mut self.state.lock())?;
        self.ensure_size()?;

        let _writer = self.writer_lock.lock_shared(deadline)?;
        let mut state = self.state.lock();
        let old_size = state.file_size.unwrap_or(0);
        self.make_cached(&mut state, 0, old_size, deadline)?;
        self.stop_read_task(&mut state, deadline)?;

        self.with_fd(|f| f.write_all_at(data, offset))?;

        let new_size = old_size.max(end);
        state.modified = true;
        state.mark_local_size(new_size);
        trace!(path = %state.path, offset, len = data.len(), size = new_size, "Wrote to cache");
        Ok(data.len())
    }

    /// Set the file length to `length`.
    pub fn truncate(self: &Arc<Self>, length: u64) -> CacheResult<()> {
        let deadline = self.cond.deadline();
        take_read_error(&mut self.state.lock())?;
        let known = self.ensure_size()?;

        let _writer = self.writer_lock.lock_exclusive(deadline)?;
        let mut state = self.state.lock();
        if state.file_size == Some(length) {
            return Ok(());
        }

        self.stop_read_task(&mut state, deadline)?;
        if length != 0 {
            let keep = length.min(state.file_size.unwrap_or(known));
            self.make_cached(&mut state, 0, keep, deadline)?;
            self.stop_read_task(&mut state, deadline)?;
        }

        self.with_fd(|f| {
            f.set_len(length)?;
            f.sync_all()
        })?;
        state.modified = true;
        state.mark_local_size(length);
        debug!(path = %state.path, length, "Truncated cache file");
        Ok(())
    }

    /// Upload local changes and wait for the upload to finish.
    ///
    /// Fails with [`CacheError::Busy`] while other opens of the path are live.
    /// A [`CacheError::Retry`] leaves the upload running; calling `flush`
    /// again waits for it.
    pub fn flush(self: &Arc<Self>) -> CacheResult<()> {
        let deadline = self.cond.deadline();
        let mut state = self.state.lock();
        take_read_error(&mut state)?;
        if state.open_refs() > 1 {
            return Err(CacheError::Busy(format!(
                "{}: file handle has {} references",
                state.path, state.ref_count
            )));
        }

        while state.flush_queued {
            self.cond.wait(&mut state, deadline)?;
        }
        if let Some(task) = state.read_task.as_mut() {
            task.abort();
        }

        if state.modified && !state.obsolete {
            self.queue_flush(&mut state, deadline)?;
        }

        while state.flush_queued || state.read_task.is_some() {
            self.cond.wait(&mut state, deadline)?;
        }
        match state.flush_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop one open reference, flushing first if it is the last one.
    pub fn release(self: &Arc<Self>) -> CacheResult<()> {
        if self.state.lock().open_refs() == 1 {
            match self.flush() {
                Ok(()) | Err(CacheError::Busy(_)) => {}
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(path = %self.path(), error = %e, "Flush on release failed");
                    self.deref()?;
                    return Err(e);
                }
            }
        }
        self.deref()
    }

    /// Drop one reference without flushing. The last reference closes the
    /// descriptor, persists (or, for unflushed changes, deletes) the
    /// metadata, and unregisters the handle.
    pub(crate) fn deref(&self) -> CacheResult<()> {
        let mut registry = self.cache.registry.lock();
        let mut state = self.state.lock();
        let mut fd = self.fd.lock();

        state.ref_count = state
            .ref_count
            .checked_sub(1)
            .ok_or_else(|| CacheError::consistency(format!("{}: deref below zero", state.path)))?;
        if state.ref_count > 0 {
            return Ok(());
        }

        drop(fd.take());
        if let Some(task) = state.read_task.take() {
            trace!(path = %state.path, id = task.id(), "Detached read task from closed handle");
        }

        if !state.obsolete {
            if state.modified {
                if let Err(e) = CacheMetaData::remove(&state.meta_path) {
                    warn!(path = %state.path, error = %e, "Failed to remove stale metadata");
                }
            } else if let Some(meta) = state.metadata.as_ref() {
                if let Err(e) = meta.persist(&state.meta_path) {
                    warn!(path = %state.path, error = %e, "Failed to persist metadata");
                }
            }
            registry.remove_if(&state.path, |h| std::ptr::eq(Arc::as_ptr(h), self));
        }

        self.cond.notify_all();
        debug!(path = %state.path, modified = state.modified, "File handle closed");
        Ok(())
    }

    /// fsync the cache file.
    pub fn fsync(&self) -> CacheResult<()> {
        let _state = self.state.lock();
        if let Some(file) = self.fd.lock().as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Size and modification time of the cache file.
    pub fn file_info(&self) -> CacheResult<(u64, SystemTime)> {
        self.with_fd(|f| {
            let meta = f.metadata()?;
            Ok((meta.len(), meta.modified()?))
        })
    }

    /// Delete the remote object.
    pub fn delete_remote(&self, force: bool) -> CacheResult<()> {
        self.proxy.delete_remote(force)
    }

    /// Establish the cached state on open: trust or fetch the header, and
    /// surface a missing remote object.
    pub(crate) fn prepare_open(
        self: &Arc<Self>,
        is_new: bool,
        must_exist: bool,
        trust_metadata: bool,
    ) -> CacheResult<()> {
        let deadline = self.cond.deadline();
        let mut state = self.state.lock();

        if state.status == CacheStatus::Unknown {
            self.initialize(&mut state, is_new, trust_metadata)?;
        }

        let wants_header = (state.ref_count == 1 || !state.got_header)
            && !state.modified
            && (state.metadata.is_none() || !trust_metadata);
        if wants_header {
            if state.read_task.is_none() {
                debug!(path = %state.path, "Fetching header from backing store");
                self.start_read(&mut state, 0, 0, None)?;
            }
            while !state.got_header && state.read_error.is_none() {
                if state.read_task.is_none() {
                    return Err(CacheError::backing(format!(
                        "{}: backing store did not report size and checksum",
                        state.path
                    )));
                }
                self.cond.wait(&mut state, deadline)?;
            }
        }

        if let Some(err) = state.read_error.take() {
            if !err.is_not_found() || must_exist {
                return Err(err);
            }
            debug!(path = %state.path, "Remote object missing, treating as empty");
            self.with_fd(|f| f.set_len(0))?;
            state.metadata = Some(CacheMetaData::new(0, ZERO_LENGTH_MD5));
            state.file_size = Some(0);
            state.got_header = true;
            state.status = CacheStatus::Full;
        }
        Ok(())
    }

    fn initialize(
        &self,
        state: &mut FileState,
        is_new: bool,
        trust_metadata: bool,
    ) -> CacheResult<()> {
        state.status = CacheStatus::Partial;
        if is_new {
            state.modified = true;
            self.set_header(state, 0, ZERO_LENGTH_MD5)?;
        } else if let Some(meta) = load_metadata(&state.meta_path) {
            if meta.is_complete() {
                state.status = CacheStatus::Full;
            }
            let (size, checksum) = (meta.size(), meta.checksum().to_owned());
            state.file_size = Some(size);
            state.metadata = Some(meta);
            if trust_metadata {
                self.set_header(state, size, &checksum)?;
            }
        }

        let nothing_resident = state
            .metadata
            .as_ref()
            .is_none_or(|m| m.resident_count() == 0);
        if state.status != CacheStatus::Full && nothing_resident {
            self.with_fd(|f| {
                f.set_len(0)?;
                f.sync_all()
            })?;
            if state.file_size == Some(0) {
                state.status = CacheStatus::Full;
            }
        }
        Ok(())
    }

    /// Accept the remote size and checksum. Only the first call counts.
    pub(crate) fn set_header(
        &self,
        state: &mut FileState,
        size: u64,
        checksum: &str,
    ) -> CacheResult<()> {
        if state.got_header {
            return Ok(());
        }
        debug!(path = %state.path, size, checksum, "Header received");
        state.file_size = Some(size);

        let unchanged = state
            .metadata
            .as_ref()
            .is_some_and(|m| m.checksum() == checksum);
        if unchanged {
            // What is cached is still valid; the header fetch need not read on.
            if let Some(task) = state.read_task.as_mut() {
                task.abort();
            }
        } else {
            if state.metadata.is_some() {
                self.with_fd(|f| f.set_len(0))?;
            }
            state.metadata = Some(CacheMetaData::new(size, checksum));
            state.status = CacheStatus::Partial;
        }

        let nothing_resident = state
            .metadata
            .as_ref()
            .is_some_and(|m| m.resident_count() == 0);
        if state.status != CacheStatus::Full && nothing_resident && state.read_task.is_none() {
            self.with_fd(|f| {
                f.set_len(0)?;
                f.sync_all()
            })?;
            if size == 0 {
                state.status = CacheStatus::Full;
            }
        }
        state.got_header = true;
        Ok(())
    }

    /// Block until `[offset, offset + size)` (clamped to the file size) is
    /// resident, starting or steering a read task as needed.
    fn make_cached(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, FileState>,
        offset: u64,
        size: u64,
        deadline: Option<Instant>,
    ) -> CacheResult<()> {
        let mut started = false;
        loop {
            if state.status == CacheStatus::Full {
                return Ok(());
            }
            let Some(file_size) = state.file_size else {
                let path = state.path.clone();
                return Err(state
                    .read_error
                    .take()
                    .unwrap_or_else(|| CacheError::consistency(format!("{path}: file size unknown"))));
            };
            let end = offset.saturating_add(size).min(file_size);
            if end <= offset {
                return Ok(());
            }
            let (first, num) = block_info(offset, end - offset);
            let last = first + num - 1;

            let Some(meta) = state.metadata.as_ref() else {
                return Err(CacheError::consistency(format!(
                    "{}: partially cached without a residency bitmap",
                    state.path
                )));
            };
            let Some((miss_first, miss_last)) = meta.missing_range(first, last) else {
                return Ok(());
            };
            let want_start = miss_first * IO_BLOCK_SIZE;
            let want_end = ((miss_last + 1) * IO_BLOCK_SIZE).min(file_size);
            let optional_end = meta
                .next_resident_block(miss_last)
                .map_or(file_size, |b| b * IO_BLOCK_SIZE);

            let continue_max = self.cache.config.read_continue_max;
            if let Some(task) = state.read_task.as_mut() {
                if !task.is_aborted()
                    && task.is_new_read_best(want_start, want_end - want_start, continue_max)
                {
                    debug!(id = task.id(), want_start, want_end, "Aborting read task for a new range");
                    task.abort();
                }
                self.cond.wait(state, deadline)?;
                continue;
            }

            if let Some(err) = state.read_error.take() {
                return Err(err);
            }
            if started {
                return Err(CacheError::backing(format!(
                    "{}: backing store ended before byte {want_end}",
                    state.path
                )));
            }
            self.start_read(
                state,
                want_start,
                want_end - want_start,
                Some(optional_end - want_start),
            )?;
            started = true;
            self.cond.wait(state, deadline)?;
        }
    }

    fn start_read(
        self: &Arc<Self>,
        state: &mut FileState,
        start: u64,
        mandatory_size: u64,
        optional_size: Option<u64>,
    ) -> CacheResult<u64> {
        state.next_task_id += 1;
        let id = state.next_task_id;
        state.read_error = None;
        state.read_task = Some(ReadTask::new(id, start, mandatory_size, optional_size));
        self.cache.stats.record_backing_read();
        trace!(path = %state.path, id, start, mandatory_size, ?optional_size, "Starting read task");

        if let Err(e) = read_thread::spawn(Arc::clone(self), id, start, optional_size) {
            state.read_task = None;
            return Err(e);
        }
        Ok(id)
    }

    fn stop_read_task(
        &self,
        state: &mut MutexGuard<'_, FileState>,
        deadline: Option<Instant>,
    ) -> CacheResult<()> {
        if let Some(task) = state.read_task.as_mut() {
            task.abort();
            self.cond.notify_all();
        }
        while state.read_task.is_some() {
            self.cond.wait(state, deadline)?;
        }
        Ok(())
    }

    fn ensure_size(&self) -> CacheResult<u64> {
        if let Some(size) = self.state.lock().file_size {
            return Ok(size);
        }
        let size = self.proxy.size()?;
        Ok(*self.state.lock().file_size.get_or_insert(size))
    }

    /// Take the writer lock exclusively and hand the handle to the flush
    /// queue. The worker takes the lock over and releases it.
    fn queue_flush(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, FileState>,
        deadline: Option<Instant>,
    ) -> CacheResult<()> {
        let exclusive =
            MutexGuard::unlocked(state, || self.writer_lock.lock_exclusive(deadline))?;
        if state.flush_queued || !state.modified || state.obsolete {
            return Ok(());
        }

        let owner = exclusive.detach();
        state.ref_count += 1;
        state.flush_queued = true;
        state.flush_error = None;
        debug!(path = %state.path, "Flush queued");

        if let Err(e) = self.cache.flush_queue.submit(Arc::clone(self)) {
            state.ref_count -= 1;
            state.flush_queued = false;
            if let Err(release) = self.writer_lock.release_exclusive(owner) {
                error!(path = %state.path, error = %release, "Failed to release writer lock");
            }
            return Err(e);
        }
        Ok(())
    }

    fn upload(&self, owner: LockOwner) -> CacheResult<()> {
        self.writer_lock.steal(owner)?;

        let size = self.with_fd(|f| {
            f.sync_all()?;
            Ok(f.metadata()?.len())
        })?;
        let checksum = {
            let mut reader = CacheReader::new(&self.fd, size);
            self.proxy.write_to_backing(&mut reader)?
        };

        let meta = CacheMetaData::fully_resident(size, checksum);
        let mut state = self.state.lock();
        if !state.obsolete {
            if let Err(e) = meta.persist(&state.meta_path) {
                warn!(path = %state.path, error = %e, "Failed to persist metadata after flush");
            }
        }
        state.metadata = Some(meta);
        state.file_size = Some(size);
        state.modified = false;
        Ok(())
    }
}

impl Flushable for FileHandle {
    #[instrument(level = "debug", skip(self), fields(path = %self.path()))]
    fn flush_node(&self, worker: WorkerId) {
        let owner = LockOwner::Worker(worker);
        let result = self.upload(owner);
        self.cache.stats.record_flush(result.is_ok());
        match &result {
            Ok(()) => debug!("Flushed to backing store"),
            Err(e) => error!(error = %e, "Flush to backing store failed"),
        }

        if let Err(e) = self.writer_lock.release_exclusive(owner) {
            warn!(error = %e, "Writer lock not released by flush worker");
        }
        if let Err(e) = self.deref() {
            warn!(error = %e, "Deref after flush failed");
        }
        {
            let mut state = self.state.lock();
            state.flush_queued = false;
            if let Err(e) = result {
                state.flush_error = Some(e);
            }
            self.cond.notify_all();
        }

        if let Err(e) = self.cache.check_cache_space() {
            warn!(error = %e, "Cache space check after flush failed");
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FileHandle")
            .field("path", &state.path)
            .field("ref_count", &state.ref_count)
            .field("status", &state.status)
            .field("modified", &state.modified)
            .field("file_size", &state.file_size)
            .finish_non_exhaustive()
    }
}

/// Load persisted metadata, discarding a record that cannot be parsed.
fn load_metadata(path: &Path) -> Option<CacheMetaData> {
    match CacheMetaData::load(path) {
        Ok(meta) => meta,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Discarding unreadable cache metadata");
            if let Err(e) = CacheMetaData::remove(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove unreadable metadata");
            }
            None
        }
    }
}

/// Surface, once, an error a read task left behind.
fn take_read_error(state: &mut FileState) -> CacheResult<()> {
    match state.read_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
