//! Background fetch of a byte range from the backing store.
//!
//! A read task streams `[start, optional_end)` into the cache file. The part
//! up to `mandatory_end` is what some caller is blocked on; the rest is
//! read-ahead that is dropped as soon as the task is aborted. Abort is
//! cooperative: the flag is checked on every block write and the task only
//! stops once its mandatory range is resident.
//!
//! The [`ReadTask`] record lives in the file handle's state and is only
//! touched with that lock held. The thread itself only carries the task id,
//! so a task that has been detached from its handle (the handle closed)
//! notices on its next write and stops.

use std::sync::Arc;
use std::thread;
use tracing::{debug, error, trace};

use crate::config::IO_BLOCK_SIZE;
use crate::error::{CacheError, CacheResult};
use crate::file_handle::{CacheStatus, FileHandle};
use crate::io_proxy::CacheWriter;

/// In-flight fetch for one file handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTask {
    id: u64,
    start: u64,
    mandatory_end: u64,
    optional_end: Option<u64>,
    current_byte: u64,
    aborted: bool,
}

impl ReadTask {
    /// A task reading `mandatory_size` bytes from `start`, and optionally
    /// continuing for `optional_size` bytes in total (`None` = to EOF).
    pub fn new(id: u64, start: u64, mandatory_size: u64, optional_size: Option<u64>) -> Self {
        Self {
            id,
            start,
            mandatory_end: start + mandatory_size,
            optional_end: optional_size.map(|s| start + s),
            current_byte: start,
            aborted: false,
        }
    }

    /// Task identity, unique per handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// First byte fetched.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// End of the range the task must fetch before it may stop.
    pub fn mandatory_end(&self) -> u64 {
        self.mandatory_end
    }

    /// End of the read-ahead range, `None` meaning end of file.
    pub fn optional_end(&self) -> Option<u64> {
        self.optional_end
    }

    /// Byte just past the last write that landed.
    pub fn current_byte(&self) -> u64 {
        self.current_byte
    }

    pub(crate) fn set_current_byte(&mut self, byte: u64) {
        self.current_byte = byte;
    }

    /// Ask the task to stop once its mandatory range is resident.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Whether [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether an aborted task may stop now that everything up to
    /// `last_complete` is resident.
    pub fn should_stop(&self, last_complete: u64, file_size: u64) -> bool {
        self.aborted && self.mandatory_end <= last_complete && last_complete <= file_size
    }

    /// Decide whether a request for `[start, start + size)` needs a new task.
    ///
    /// Returns `false` after extending this task's mandatory range when the
    /// request begins at or before the task's progress, or no more than
    /// `continue_max` bytes past it, and ends within the read-ahead range.
    /// Returns `true` when a new task is required; if the request runs past
    /// the read-ahead range the whole of it becomes mandatory first, so the
    /// data already in flight is not thrown away.
    pub fn is_new_read_best(&mut self, start: u64, size: u64, continue_max: u64) -> bool {
        if start < self.start {
            return true;
        }
        if let Some(optional_end) = self.optional_end {
            if start + size > optional_end {
                self.mandatory_end = optional_end;
                return true;
            }
        }
        let read_ref = self.mandatory_end.max(self.current_byte);
        if start <= read_ref || start - read_ref <= continue_max {
            self.mandatory_end = self.mandatory_end.max(start + size);
            return false;
        }
        true
    }
}

/// Start the thread for the task `id`, which must already be installed in
/// the handle's state.
pub(crate) fn spawn(
    handle: Arc<FileHandle>,
    id: u64,
    start: u64,
    optional_size: Option<u64>,
) -> CacheResult<()> {
    thread::Builder::new()
        .name("cache-read".into())
        .spawn(move || execute(&handle, id, start, optional_size))?;
    Ok(())
}

fn execute(handle: &Arc<FileHandle>, id: u64, start: u64, optional_size: Option<u64>) {
    trace!(path = %handle.path(), id, start, ?optional_size, "Read task started");
    let result = {
        let mut writer = CacheWriter::new(handle, id);
        handle
            .proxy()
            .read_from_backing(&mut writer, optional_size, start, IO_BLOCK_SIZE)
    };
    finish(handle, id, result);
}

/// Record the outcome of task `id` and detach it from the handle.
fn finish(handle: &FileHandle, id: u64, result: CacheResult<()>) {
    let mut state = handle.state.lock();
    let current = state.read_task.as_ref().is_some_and(|t| t.id() == id);
    let aborted = matches!(result, Err(CacheError::Aborted));

    match result {
        Ok(()) | Err(CacheError::Aborted) => {
            if aborted {
                debug!(path = %state.path, id, "Read task aborted");
            }
            if current && state.got_header {
                let complete = state.file_size == Some(0)
                    || state.metadata.as_ref().is_some_and(|m| m.is_complete());
                if complete {
                    state.status = CacheStatus::Full;
                }
            }
        }
        Err(e) => {
            error!(path = %state.path, id, error = %e, "Read from backing store failed");
            if current {
                state.read_error = Some(e);
            }
        }
    }

    if current {
        state.read_task = None;
    }
    handle.cond.notify_all();
}
