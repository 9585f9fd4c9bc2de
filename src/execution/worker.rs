//! Bounded worker pool for asynchronous executions.
//!
//! Jobs go into one shared FIFO queue with a fixed depth. Submission never
//! blocks: a full queue is reported to the caller. On drop, workers finish
//! every job already accepted before exiting.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads (0 = one per CPU).
    pub num_threads: usize,
    /// Max jobs waiting for a worker.
    pub queue_depth: usize,
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            queue_depth: 64,
            thread_name_prefix: "nnrt-exec".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.num_threads
        }
    }
}

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum WorkerPoolError {
    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Job queue is full")]
    QueueFull,

    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawnFailed(String),
}

/// Text of a panic payload, when it carries one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
    executed: AtomicUsize,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    queue_depth: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("queue_depth", &self.queue_depth)
            .field("queued", &self.queued())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Result<Self, WorkerPoolError> {
        let num_threads = config.resolved_threads();
        let queue_depth = config.queue_depth.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(queue_depth)),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            executed: AtomicUsize::new(0),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(num_threads),
            queue_depth,
        };
        for id in 0..num_threads {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, id))
                .spawn(move || Self::worker_loop(&shared))
                .map_err(|e| WorkerPoolError::ThreadSpawnFailed(e.to_string()))?;
            pool.workers.push(handle);
        }
        debug!(threads = num_threads, queue_depth, "Worker pool started");
        Ok(pool)
    }

    /// Queue a job. Never blocks.
    pub fn submit(&self, job: Job) -> Result<(), WorkerPoolError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(WorkerPoolError::PoolShutdown);
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.queue_depth {
                return Err(WorkerPoolError::QueueFull);
            }
            queue.push_back(job);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if shared.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                    shared.available.wait(&mut queue);
                }
            };
            let Some(job) = job else {
                return;
            };
            // A panicking job must not take its worker down with it.
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                warn!(panic = panic_message(payload.as_ref()), "Job panicked");
            }
            shared.executed.fetch_add(1, Ordering::Relaxed);
            trace!("Job finished");
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Jobs run to completion so far.
    pub fn executed(&self) -> usize {
        self.shared.executed.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let _queue = self.shared.queue.lock();
            self.shared.available.notify_all();
        }
        // The last owner may be a job running on one of our own workers.
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool(threads: usize, depth: usize) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            num_threads: threads,
            queue_depth: depth,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_jobs_run() {
        let pool = pool(2, 8);
        assert_eq!(pool.num_threads(), 2);
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let mut seen: Vec<i32> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let pool = pool(1, 1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.submit(Box::new(|| {})).unwrap();
        assert!(matches!(pool.submit(Box::new(|| {})), Err(WorkerPoolError::QueueFull)));
        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_drop_drains_accepted_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = pool(1, 16);
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.submit(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_default_config_resolves_threads() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.queue_depth, 64);
        assert!(config.resolved_threads() >= 1);
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = pool(1, 4);
        pool.submit(Box::new(|| panic!("job failed"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(thread::current().name().map(String::from)).unwrap()))
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("nnrt-exec-0"));
    }
}
