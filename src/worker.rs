//! Fixed-size worker pool with keyed dispatch.
//!
//! Each worker drains its own unbounded queue, so every job submitted with
//! the same key runs on the same thread in submission order.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, unbounded};
use log::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    queues: Vec<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let mut queues = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);
        for idx in 0..size {
            let (tx, rx) = unbounded::<Job>();
            let handle = thread::Builder::new()
                .name(format!("rpcfs-worker-{idx}"))
                .spawn(move || {
                    for job in rx.iter() {
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                            error!("worker {} job panicked", idx);
                        }
                    }
                    debug!("worker {} stopped", idx);
                });
            match handle {
                Ok(handle) => {
                    queues.push(tx);
                    handles.push(handle);
                }
                Err(e) => error!("failed to start worker {}: {}", idx, e),
            }
        }
        Self { queues, handles }
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Worker index that owns `key`.
    pub fn worker_for(&self, key: u64) -> usize {
        (key % self.queues.len().max(1) as u64) as usize
    }

    /// Queue `job` on the worker owning `key`. Returns false if the pool has
    /// no live worker left to run it.
    pub fn submit<F>(&self, key: u64, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.queues.is_empty() {
            return false;
        }
        let idx = self.worker_for(key);
        self.queues[idx].send(Box::new(job)).is_ok()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.queues.clear();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            let _ = handle.join();
        }
    }
}
