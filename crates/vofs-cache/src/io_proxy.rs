//! Backing-store contract.
//!
//! The cache never talks to the remote store itself. Each [`FileHandle`] owns
//! one [`IoProxy`] for its path, supplied by the caller of
//! [`Cache::open`](crate::Cache::open). Downloads land through the
//! [`CacheWriter`] handed to [`IoProxy::read_from_backing`]; uploads read the
//! cache file through the [`CacheReader`] handed to
//! [`IoProxy::write_to_backing`].

use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use tracing::trace;

use crate::config::IO_BLOCK_SIZE;
use crate::error::{CacheError, CacheResult};
use crate::file_handle::FileHandle;
use crate::metadata::block_info;

/// Access to one remote object.
pub trait IoProxy: Send + Sync {
    /// Size of the remote object.
    fn size(&self) -> CacheResult<u64>;

    /// Checksum of the remote object.
    fn checksum(&self) -> CacheResult<String>;

    /// Stream `size` bytes starting at `offset` (`None` = to end of object)
    /// into the cache.
    ///
    /// Implementations must call [`CacheWriter::set_header`] once, before
    /// the first block, then deliver data in order with
    /// [`CacheWriter::write_block`], preferably in `block_size` pieces. A
    /// [`CacheError::Aborted`] from the writer must be returned unchanged.
    /// A missing object is reported as [`CacheError::NotFound`].
    fn read_from_backing(
        &self,
        writer: &mut CacheWriter<'_>,
        size: Option<u64>,
        offset: u64,
        block_size: u64,
    ) -> CacheResult<()>;

    /// Upload the full content of the cache file. Returns the checksum the
    /// store recorded.
    fn write_to_backing(&self, reader: &mut CacheReader<'_>) -> CacheResult<String>;

    /// Delete the remote object.
    fn delete_remote(&self, force: bool) -> CacheResult<()>;
}

/// Sink for data arriving from the backing store.
///
/// Only offsets that continue the previous write, or that jump to a block
/// boundary after a write that itself ended on a boundary (or at end of file),
/// are accepted. This keeps the residency bitmap from marking a block whose
/// beginning was never written.
pub struct CacheWriter<'a> {
    handle: &'a FileHandle,
    task_id: u64,
    cursor: Option<u64>,
}

impl<'a> CacheWriter<'a> {
    pub(crate) fn new(handle: &'a FileHandle, task_id: u64) -> Self {
        Self {
            handle,
            task_id,
            cursor: None,
        }
    }

    /// Report the remote size and checksum.
    pub fn set_header(&mut self, size: u64, checksum: &str) -> CacheResult<()> {
        let mut state = self.handle.state.lock();
        if !state.read_task.as_ref().is_some_and(|t| t.id() == self.task_id) {
            return Err(CacheError::Aborted);
        }
        self.handle.set_header(&mut state, size, checksum)?;
        self.handle.cond.notify_all();
        Ok(())
    }

    /// Size the header declared, once known.
    pub fn file_size(&self) -> Option<u64> {
        let state = self.handle.state.lock();
        state.file_size.filter(|_| state.got_header)
    }

    /// Write `buf` at `offset` in the cache file and mark the blocks it
    /// completes as resident.
    ///
    /// Fails with [`CacheError::Aborted`] once the task has been told to stop
    /// and its mandatory range is resident (checked before and after the
    /// write), or if the task has been detached from its handle.
    pub fn write_block(&mut self, buf: &[u8], offset: u64) -> CacheResult<usize> {
        let len = buf.len() as u64;
        let file_size = {
            let state = self.handle.state.lock();
            match state.read_task.as_ref() {
                Some(task) if task.id() == self.task_id => {
                    // Once aborted, nothing past the mandatory range may land.
                    if task.is_aborted() && task.mandatory_end() <= offset {
                        return Err(CacheError::Aborted);
                    }
                }
                _ => return Err(CacheError::Aborted),
            }
            let Some(file_size) = state.file_size.filter(|_| state.got_header) else {
                return Err(CacheError::consistency(
                    "Block written to cache before the header was set",
                ));
            };
            file_size
        };

        if let Some(cursor) = self.cursor {
            if cursor != offset
                && (offset % IO_BLOCK_SIZE != 0
                    || (cursor % IO_BLOCK_SIZE != 0 && cursor != file_size))
            {
                return Err(CacheError::consistency(format!(
                    "Only seeks to block boundaries are permitted when writing to cache: \
                     offset {offset}, cursor {cursor}, file size {file_size}"
                )));
            }
        }
        let end = offset.saturating_add(len);
        if end > file_size {
            return Err(CacheError::consistency(format!(
                "Attempt to populate cache past the end of the known file size: {end} > {file_size}"
            )));
        }

        self.handle.with_fd(|f| {
            f.write_all_at(buf, offset)?;
            f.sync_data()
        })?;

        let mut state = self.handle.state.lock();
        let mut last_complete = offset + len;
        if last_complete != file_size {
            last_complete -= last_complete % IO_BLOCK_SIZE;
        }
        if last_complete > offset {
            let (first, num) = block_info(offset, last_complete - offset);
            if num > 0 {
                if let Some(meta) = state.metadata.as_mut() {
                    meta.set_read_blocks(first, first + num - 1)?;
                }
                self.handle.cond.notify_all();
            }
        }
        self.cursor = Some(offset + len);
        self.handle.stats().record_bytes_fetched(len);
        trace!(path = %state.path, offset, len, last_complete, "Block written to cache");

        match state.read_task.as_mut() {
            Some(task) if task.id() == self.task_id => {
                task.set_current_byte(offset + len);
                if task.should_stop(last_complete, file_size) {
                    return Err(CacheError::Aborted);
                }
            }
            _ => return Err(CacheError::Aborted),
        }
        Ok(buf.len())
    }
}

/// Sequential reader over a cache file, used for uploads.
///
/// Every read goes through the handle's descriptor lock, at the reader's own
/// position, so it never disturbs other users of the descriptor.
pub struct CacheReader<'a> {
    fd: &'a Mutex<Option<File>>,
    pos: u64,
    len: u64,
}

impl<'a> CacheReader<'a> {
    pub(crate) fn new(fd: &'a Mutex<Option<File>>, len: u64) -> Self {
        Self { fd, pos: 0, len }
    }

    /// Total bytes the upload will deliver.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.len - self.pos
    }
}

impl Read for CacheReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(self.remaining()).unwrap_or(usize::MAX));
        let guard = self.fd.lock();
        let Some(file) = guard.as_ref() else {
            return Err(io::Error::other("cache file descriptor is closed"));
        };
        let n = file.read_at(&mut buf[..want], self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}
