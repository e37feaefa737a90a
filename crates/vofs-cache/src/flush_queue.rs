//! Fixed pool of upload workers.
//!
//! Modified file handles are queued here by `flush()` and uploaded by one of
//! `max_flush_threads` worker threads, strictly in submission order. The
//! queue is unbounded: the submitting thread already holds the file's writer
//! lock and blocks on the outcome, so back-pressure comes from the callers.
//!
//! # Gauges
//!
//! The queue owns its own `active` (flushing right now) and `outstanding`
//! (queued or flushing) gauges. [`FlushQueue::wait_idle`] blocks until
//! `outstanding` drops to zero.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace};

use crate::error::{CacheError, CacheResult};
use crate::shared_lock::WorkerId;

/// Work item processed by a [`FlushQueue`] worker.
pub trait Flushable: Send + Sync + 'static {
    /// Upload the item. Failures are recorded on the item itself.
    fn flush_node(&self, worker: WorkerId);
}

#[derive(Debug, Default)]
struct QueueGauges {
    active: AtomicUsize,
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl QueueGauges {
    fn release_slot(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// FIFO pool of flush workers.
pub struct FlushQueue<T: Flushable> {
    sender: Mutex<Option<Sender<Arc<T>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    gauges: Arc<QueueGauges>,
    threads: usize,
}

impl<T: Flushable> FlushQueue<T> {
    /// Start `threads` workers (at least one).
    pub fn new(threads: usize) -> CacheResult<Self> {
        let threads = threads.max(1);
        let (tx, rx) = unbounded::<Arc<T>>();
        let gauges = Arc::new(QueueGauges::default());

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let gauges = Arc::clone(&gauges);
            let handle = thread::Builder::new()
                .name(format!("flush-{i}"))
                .spawn(move || worker_loop(WorkerId(i), rx, gauges))?;
            workers.push(handle);
        }

        info!(threads, "Flush queue started");

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            gauges,
            threads,
        })
    }

    /// Queue an item for upload.
    pub fn submit(&self, item: Arc<T>) -> CacheResult<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(CacheError::ShutDown);
        };
        *self.gauges.outstanding.lock() += 1;
        if tx.send(item).is_err() {
            self.gauges.release_slot();
            return Err(CacheError::ShutDown);
        }
        trace!(outstanding = self.pending_count(), "Flush queued");
        Ok(())
    }

    /// Block until every queued flush has completed.
    ///
    /// Must not be called from a flush worker.
    pub fn wait_idle(&self) {
        let mut outstanding = self.gauges.outstanding.lock();
        while *outstanding > 0 {
            self.gauges.idle.wait(&mut outstanding);
        }
    }

    /// Stop accepting work, drain what is queued and join the workers.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let Some(tx) = self.sender.lock().take() else {
            return;
        };
        drop(tx);
        debug!("Flush queue draining");

        let me = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Flush worker panicked");
            }
        }
        info!("Flush queue shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Number of flushes running right now.
    pub fn active_count(&self) -> usize {
        self.gauges.active.load(Ordering::Relaxed)
    }

    /// Number of flushes queued or running.
    pub fn pending_count(&self) -> usize {
        *self.gauges.outstanding.lock()
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.threads
    }
}

impl<T: Flushable> Drop for FlushQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Flushable> std::fmt::Debug for FlushQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushQueue")
            .field("threads", &self.threads)
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::needless_pass_by_value)] // thread entry point owns its channel and gauges
fn worker_loop<T: Flushable>(worker: WorkerId, rx: Receiver<Arc<T>>, gauges: Arc<QueueGauges>) {
    debug!(%worker, "Flush worker started");
    for item in rx.iter() {
        let active = gauges.active.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(%worker, active, "Flush worker picked up a node");
        item.flush_node(worker);
        drop(item);
        gauges.active.fetch_sub(1, Ordering::Relaxed);
        gauges.release_slot();
    }
    debug!(%worker, "Flush worker exiting");
}
