//! The cache directory and its registry of open files.
//!
//! A [`Cache`] owns two mirrored trees under its root: `data/` holds one
//! (possibly sparse) file per cached remote path and `metaData/` holds the
//! JSON residency record for each. Opening a path returns the one
//! [`FileHandle`] shared by every concurrent open of it.
//!
//! Eviction is least-recently-accessed first by file atime, skips every file
//! with a live handle, and runs after each open and each flush until the
//! data tree fits in `max_cache_size`.

use parking_lot::Mutex;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, instrument, trace, warn};
use walkdir::WalkDir;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::file_handle::FileHandle;
use crate::flush_queue::FlushQueue;
use crate::io_proxy::IoProxy;
use crate::metadata::CacheMetaData;
use crate::registry::HandleRegistry;
use crate::stats::{CacheStats, CacheStatsSnapshot};

/// Result of scanning the data tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheUsage {
    /// Apparent size of every cache file.
    pub total_bytes: u64,
    /// Least recently accessed cache file with no open handle.
    pub oldest: Option<PathBuf>,
}

/// Attributes of a locally modified file that the backing store does not
/// know about yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    /// Size of the cache file.
    pub size: u64,
    /// Modification time of the cache file.
    pub mtime: SystemTime,
}

/// State shared between the [`Cache`] front and its file handles.
pub(crate) struct CacheShared {
    pub(crate) config: CacheConfig,
    root: PathBuf,
    data_dir: PathBuf,
    meta_dir: PathBuf,
    pub(crate) registry: Mutex<HandleRegistry<Arc<FileHandle>>>,
    pub(crate) flush_queue: FlushQueue<FileHandle>,
    pub(crate) stats: CacheStats,
}

impl CacheShared {
    pub(crate) fn data_path(&self, path: &str) -> PathBuf {
        self.data_dir.join(path.trim_start_matches('/'))
    }

    pub(crate) fn meta_path(&self, path: &str) -> PathBuf {
        self.meta_dir.join(path.trim_start_matches('/'))
    }

    /// Remote path of a file in the data tree.
    fn remote_path(&self, data_file: &Path) -> Option<String> {
        let rel = data_file.strip_prefix(&self.data_dir).ok()?;
        Some(format!("/{}", rel.to_string_lossy()))
    }

    pub(crate) fn determine_cache_size(&self) -> CacheUsage {
        let mut usage = CacheUsage::default();
        let mut oldest_atime: Option<SystemTime> = None;

        for entry in WalkDir::new(&self.data_dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    trace!(error = %e, "Skipping unreadable cache entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            usage.total_bytes += meta.len();

            let in_use = self
                .remote_path(entry.path())
                .is_some_and(|p| self.registry.lock().contains(&p));
            if in_use {
                continue;
            }
            let atime = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if oldest_atime.is_none_or(|t| atime < t) {
                oldest_atime = Some(atime);
                usage.oldest = Some(entry.into_path());
            }
        }
        usage
    }

    pub(crate) fn check_cache_space(&self) -> CacheResult<()> {
        loop {
            let usage = self.determine_cache_size();
            if usage.total_bytes <= self.config.max_cache_size {
                return Ok(());
            }
            let Some(victim) = usage.oldest else {
                debug!(
                    total = usage.total_bytes,
                    max = self.config.max_cache_size,
                    "Cache over size but every file is open"
                );
                return Ok(());
            };
            let Some(path) = self.remote_path(&victim) else {
                return Ok(());
            };

            let registry = self.registry.lock();
            if registry.contains(&path) {
                continue;
            }
            match fs::remove_file(&victim) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to evict cache file");
                    return Err(e.into());
                }
            }
            let meta_file = self.meta_path(&path);
            if let Err(e) = CacheMetaData::remove(&meta_file) {
                warn!(path = %path, error = %e, "Failed to remove metadata of evicted file");
            }
            if let Some(dir) = victim.parent() {
                self.remove_empty_dirs(dir)?;
            }
            if let Some(dir) = meta_file.parent() {
                self.remove_empty_dirs(dir)?;
            }
            drop(registry);

            self.stats.record_eviction();
            debug!(path = %path, total = usage.total_bytes, "Evicted cache file");
        }
    }

    /// Remove `dir` and its ancestors while they are empty, stopping at the
    /// top of the data or metadata tree.
    pub(crate) fn remove_empty_dirs(&self, dir: &Path) -> CacheResult<()> {
        if !dir.starts_with(&self.root) {
            return Err(CacheError::InvalidPath(format!(
                "{} is outside the cache directory",
                dir.display()
            )));
        }
        let mut current = dir;
        while current != self.data_dir && current != self.meta_dir && current != self.root {
            match fs::remove_dir(current) {
                Ok(()) => trace!(dir = %current.display(), "Removed empty cache directory"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(())
    }
}

/// Disk-backed sparse cache of remote files.
pub struct Cache {
    inner: Arc<CacheShared>,
}

impl Cache {
    /// Create the cache directories and start the flush workers.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        let root = std::path::absolute(&config.cache_dir)?;
        let data_dir = root.join(crate::config::DATA_SUBDIR);
        let meta_dir = root.join(crate::config::METADATA_SUBDIR);
        for dir in [&data_dir, &meta_dir] {
            DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
        }
        let flush_queue = FlushQueue::new(config.max_flush_threads)?;

        info!(
            root = %root.display(),
            max_cache_size = config.max_cache_size,
            read_only = config.read_only,
            "Cache opened"
        );

        Ok(Self {
            inner: Arc::new(CacheShared {
                config,
                root,
                data_dir,
                meta_dir,
                registry: Mutex::new(HandleRegistry::new()),
                flush_queue,
                stats: CacheStats::new(),
            }),
        })
    }

    /// Configuration the cache was opened with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Absolute root of the cache directory.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Directory holding cached file content.
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Directory holding residency metadata.
    pub fn metadata_dir(&self) -> &Path {
        &self.inner.meta_dir
    }

    /// Activity counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of paths with a live handle.
    pub fn open_handle_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// The live handle for `path`, if any.
    pub fn handle(&self, path: &str) -> Option<Arc<FileHandle>> {
        self.inner.registry.lock().get(path).cloned()
    }

    /// Open `path`, returning the handle shared by every open of it.
    ///
    /// `is_new` creates (or replaces) the file. Without `must_exist`, a path
    /// the backing store does not have opens as an empty file. With
    /// `trust_metadata`, persisted metadata is taken as current and the
    /// backing store is not asked for the header.
    ///
    /// Every successful open must be balanced by [`FileHandle::release`].
    #[instrument(level = "debug", skip(self, proxy))]
    pub fn open(
        &self,
        path: &str,
        is_new: bool,
        must_exist: bool,
        proxy: Box<dyn IoProxy>,
        trust_metadata: bool,
    ) -> CacheResult<Arc<FileHandle>> {
        let handle = self.get_file_handle(path, is_new, proxy)?;
        if let Err(e) = handle.prepare_open(is_new, must_exist, trust_metadata) {
            debug!(error = %e, "Open failed");
            if let Err(deref) = handle.deref() {
                warn!(error = %deref, "Failed to drop reference after failed open");
            }
            return Err(e);
        }
        self.inner.stats.record_open();

        if let Err(e) = self.inner.check_cache_space() {
            warn!(error = %e, "Cache space check after open failed");
        }
        Ok(handle)
    }

    fn get_file_handle(
        &self,
        path: &str,
        create: bool,
        proxy: Box<dyn IoProxy>,
    ) -> CacheResult<Arc<FileHandle>> {
        validate_path(path)?;
        if create && self.inner.config.read_only {
            return Err(CacheError::PermissionDenied(format!(
                "{path}: cache is read-only"
            )));
        }

        let mut registry = self.inner.registry.lock();
        let existing = registry.get(path).cloned();
        let handle = match existing {
            Some(handle) if !create => handle,
            existing => {
                if let Some(old) = existing {
                    let mut state = old.state.lock();
                    state.obsolete = true;
                    if let Err(e) = CacheMetaData::remove(&state.meta_path) {
                        warn!(path, error = %e, "Failed to remove metadata of replaced file");
                    }
                    debug!(path, "Replacing open handle on create");
                }
                let handle = Arc::new(FileHandle::new(Arc::clone(&self.inner), path, proxy)?);
                registry.insert(path.to_owned(), Arc::clone(&handle));
                handle
            }
        };
        handle.state.lock().ref_count += 1;
        Ok(handle)
    }

    /// Evict least recently accessed files until the cache fits.
    pub fn check_cache_space(&self) -> CacheResult<()> {
        self.inner.check_cache_space()
    }

    /// Total size of the data tree and the best eviction candidate.
    pub fn determine_cache_size(&self) -> CacheUsage {
        self.inner.determine_cache_size()
    }

    /// Remove `dir` and its empty ancestors up to the top of its tree.
    pub fn remove_empty_dirs(&self, dir: &Path) -> CacheResult<()> {
        self.inner.remove_empty_dirs(dir)
    }

    /// Drop `path` from the cache. A live handle keeps its descriptor but
    /// becomes obsolete.
    pub fn unlink_file(&self, path: &str) -> CacheResult<()> {
        validate_path(path)?;
        let inner = &self.inner;
        let mut registry = inner.registry.lock();
        if let Some(handle) = registry.remove(path) {
            handle.state.lock().obsolete = true;
        }

        let data_file = inner.data_path(path);
        let meta_file = inner.meta_path(path);
        CacheMetaData::remove(&meta_file)?;
        match fs::remove_file(&data_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for file in [&data_file, &meta_file] {
            if let Some(dir) = file.parent() {
                inner.remove_empty_dirs(dir)?;
            }
        }
        debug!(path, "Unlinked cache file");
        Ok(())
    }

    /// Move the cached data and metadata of file `old` to `new`, carrying a
    /// live handle along.
    pub fn rename_file(&self, old: &str, new: &str) -> CacheResult<()> {
        validate_path(old)?;
        validate_path(new)?;
        if old == new {
            return Ok(());
        }
        let inner = &self.inner;
        let (old_data, new_data) = (inner.data_path(old), inner.data_path(new));
        let (old_meta, new_meta) = (inner.meta_path(old), inner.meta_path(new));
        if old_data.is_dir() || old_meta.is_dir() {
            return Err(CacheError::InvalidPath(format!("{old} is a directory")));
        }

        let mut registry = inner.registry.lock();
        create_parent(&new_data)?;
        create_parent(&new_meta)?;
        let renames = [
            (old_data, new_data.clone()),
            (old_meta, new_meta.clone()),
        ];
        match registry.get(old).cloned() {
            Some(handle) => {
                let mut state = handle.state.lock();
                Self::atomic_rename(&renames)?;
                state.path = new.to_owned();
                state.data_path = new_data;
                state.meta_path = new_meta;
            }
            None => Self::atomic_rename(&renames)?,
        }
        if let Some(displaced) = registry.rekey(old, new) {
            displaced.state.lock().obsolete = true;
        }
        debug!(old, new, "Renamed cache file");
        Ok(())
    }

    /// Move the cached directory `old` to `new`, updating every live handle
    /// inside it.
    pub fn rename_dir(&self, old: &str, new: &str) -> CacheResult<()> {
        validate_path(old)?;
        validate_path(new)?;
        let old = old.trim_end_matches('/');
        let new = new.trim_end_matches('/');
        if old == new {
            return Ok(());
        }
        let inner = &self.inner;
        let (old_data, new_data) = (inner.data_path(old), inner.data_path(new));
        let (old_meta, new_meta) = (inner.meta_path(old), inner.meta_path(new));
        if old_data.is_file() || old_meta.is_file() {
            return Err(CacheError::InvalidPath(format!("{old} is not a directory")));
        }

        let mut registry = inner.registry.lock();
        create_parent(&new_data)?;
        create_parent(&new_meta)?;

        let moved: Vec<(String, Arc<FileHandle>)> = registry
            .paths_under(old)
            .into_iter()
            .filter_map(|p| registry.get(&p).cloned().map(|h| (p, h)))
            .collect();
        {
            let mut states: Vec<_> = moved.iter().map(|(_, h)| h.state.lock()).collect();
            Self::atomic_rename(&[(old_data, new_data), (old_meta, new_meta)])?;
            for state in &mut states {
                let path = format!("{new}{}", &state.path[old.len()..]);
                state.data_path = inner.data_path(&path);
                state.meta_path = inner.meta_path(&path);
                state.path = path;
            }
        }
        for (path, _) in &moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            if let Some(displaced) = registry.rekey(path, &renamed) {
                displaced.state.lock().obsolete = true;
            }
        }
        debug!(old, new, handles = moved.len(), "Renamed cache directory");
        Ok(())
    }

    /// Rename each `(from, to)` pair in order. A missing source is skipped.
    /// If any rename fails, the ones already done are undone in reverse.
    pub fn atomic_rename(renames: &[(PathBuf, PathBuf)]) -> CacheResult<()> {
        let mut done: Vec<&(PathBuf, PathBuf)> = Vec::with_capacity(renames.len());
        let rollback = |done: &[&(PathBuf, PathBuf)]| {
            for (from, to) in done.iter().rev() {
                if let Err(e) = fs::rename(to, from) {
                    error!(from = %to.display(), to = %from.display(), error = %e, "Rename rollback failed");
                }
            }
        };

        for pair in renames {
            let (from, to) = pair;
            match fs::symlink_metadata(from) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    rollback(&done);
                    return Err(e.into());
                }
            }
            if let Err(e) = fs::rename(from, to) {
                rollback(&done);
                return Err(e.into());
            }
            done.push(pair);
        }
        Ok(())
    }

    /// Size and mtime of `path` while it has local changes not yet flushed.
    pub fn get_attr(&self, path: &str) -> CacheResult<Option<FileAttr>> {
        let registry = self.inner.registry.lock();
        let Some(handle) = registry.get(path) else {
            return Ok(None);
        };
        let state = handle.state.lock();
        if !state.modified {
            return Ok(None);
        }
        let meta = fs::metadata(&state.data_path)?;
        Ok(Some(FileAttr {
            size: meta.len(),
            mtime: meta.modified()?,
        }))
    }

    /// Block until every queued flush has finished.
    pub fn wait_flushes(&self) {
        self.inner.flush_queue.wait_idle();
    }

    /// Drain the flush queue and stop its workers. Further flushes fail with
    /// [`CacheError::ShutDown`].
    pub fn shutdown(&self) {
        self.inner.flush_queue.shutdown();
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.inner.root)
            .field("open_handles", &self.open_handle_count())
            .field("flush_queue", &self.inner.flush_queue)
            .finish_non_exhaustive()
    }
}

/// Remote paths are absolute and never climb out of the tree.
fn validate_path(path: &str) -> CacheResult<()> {
    let mut components = Path::new(path).components();
    let rooted = matches!(components.next(), Some(Component::RootDir));
    let has_name = components.clone().next().is_some();
    let escapes = components.any(|c| matches!(c, Component::ParentDir));
    if !rooted || !has_name || escapes {
        return Err(CacheError::InvalidPath(path.to_owned()));
    }
    Ok(())
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => DirBuilder::new().recursive(true).mode(0o700).create(parent),
        None => Ok(()),
    }
}
