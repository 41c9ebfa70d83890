//! Per-peer serialized execution on a fixed pool of threads.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send>;

/// Runs jobs on `N` worker threads, where all jobs for one peer go to the
/// same thread and therefore run in submission order, one at a time.
pub struct StripedExecutor {
    stripes: Vec<Sender<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    stopped: Arc<AtomicBool>,
}

impl StripedExecutor {
    pub fn new(threads: usize, name: &str) -> Self {
        let threads = threads.max(1);
        let stopped = Arc::new(AtomicBool::new(false));
        let mut stripes = Vec::with_capacity(threads);
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let (tx, rx) = unbounded::<Job>();
            let stopped = stopped.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || run_stripe(rx, stopped));
            match spawned {
                Ok(handle) => {
                    stripes.push(tx);
                    workers.push(handle);
                }
                Err(e) => warn!("Failed to spawn worker {}-{}: {}", name, i, e),
            }
        }

        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();
        StripedExecutor {
            stripes,
            workers: Mutex::new(workers),
            worker_ids,
            stopped,
        }
    }

    pub fn threads(&self) -> usize {
        self.stripes.len()
    }

    /// Queue `job` behind earlier jobs for `peer`.
    ///
    /// Returns false if the executor is shut down.
    pub fn execute(&self, peer: SocketAddr, job: impl FnOnce() + Send + 'static) -> bool {
        if self.stopped.load(Ordering::Acquire) || self.stripes.is_empty() {
            return false;
        }
        let stripe = &self.stripes[stripe_of(peer, self.stripes.len())];
        stripe.send(Box::new(job)).is_ok()
    }

    /// Stop the workers. Queued jobs are dropped, not run.
    ///
    /// Waits for the workers unless called from one of them.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake idle workers
        for stripe in &self.stripes {
            let _ = stripe.send(Box::new(|| {}));
        }
        let current = thread::current().id();
        if self.worker_ids.contains(&current) {
            debug!("Executor shut down from a worker, not joining");
            return;
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for StripedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stripe_of(peer: SocketAddr, stripes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    peer.hash(&mut hasher);
    (hasher.finish() % stripes as u64) as usize
}

fn run_stripe(rx: Receiver<Job>, stopped: Arc<AtomicBool>) {
    while let Ok(job) = rx.recv() {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("Job panicked on {:?}", thread::current().name());
        }
    }
    trace!("Worker {:?} exiting", thread::current().name());
}
