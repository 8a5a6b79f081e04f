//! Background snapshot worker.
//!
//! A single dedicated thread that runs submitted jobs in FIFO order. The
//! snapshot engine hands each asynchronous run to this worker so `start`
//! can return immediately.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use cachesnap_core::{Result, SnapshotError};
use tracing::error;

/// Name of the worker thread
pub const WORKER_THREAD_NAME: &str = "cachesnap-snapshot-0";

type Job = Box<dyn FnOnce() + Send>;

/// Worker metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs waiting in the queue.
    pub queue_depth: usize,
    /// Jobs currently executing (0 or 1).
    pub active_jobs: usize,
    /// Jobs finished since the worker started, panicked ones included.
    pub jobs_completed: u64,
}

struct WorkerInner {
    queue: Mutex<VecDeque<Job>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    active_jobs: AtomicUsize,
    jobs_completed: AtomicU64,
}

/// Single-thread FIFO job runner
pub struct SnapshotWorker {
    inner: Arc<WorkerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotWorker {
    /// Spawn the worker thread.
    pub fn spawn() -> io::Result<Self> {
        let inner = Arc::new(WorkerInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active_jobs: AtomicUsize::new(0),
            jobs_completed: AtomicU64::new(0),
        });

        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker_loop(&inner_clone))?;

        Ok(SnapshotWorker {
            inner,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Queue a job.
    ///
    /// Fails with `WorkerUnavailable` once the worker has been shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<()> {
        {
            let mut queue = self.inner.queue.lock();
            // Checked under the lock so a job can never slip in after the
            // worker has seen shutdown with an empty queue
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(SnapshotError::WorkerUnavailable);
            }
            queue.push_back(Box::new(job));
        }
        self.inner.work_ready.notify_one();
        Ok(())
    }

    /// Block until every queued and running job has finished.
    ///
    /// The worker keeps running afterwards.
    pub fn drain(&self) {
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active_jobs.load(Ordering::Acquire) > 0 {
            self.inner.drain_cond.wait(&mut queue);
        }
    }

    /// Run remaining jobs, then stop and join the thread. Idempotent.
    pub fn shutdown(&self) {
        {
            let _queue = self.inner.queue.lock();
            self.inner.shutdown.store(true, Ordering::Release);
            self.inner.work_ready.notify_all();
        }

        if let Some(handle) = self.thread.lock().take() {
            // Joining from inside a job would deadlock
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Return a snapshot of worker metrics.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            queue_depth: self.inner.queue.lock().len(),
            active_jobs: self.inner.active_jobs.load(Ordering::Relaxed),
            jobs_completed: self.inner.jobs_completed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SnapshotWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active_jobs` and wakes drain waiters, even if the job panics.
struct ActiveJobGuard<'a> {
    inner: &'a WorkerInner,
}

impl<'a> Drop for ActiveJobGuard<'a> {
    fn drop(&mut self) {
        let queue = self.inner.queue.lock();
        self.inner.active_jobs.fetch_sub(1, Ordering::Release);
        self.inner.jobs_completed.fetch_add(1, Ordering::Relaxed);
        if queue.is_empty() {
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &WorkerInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.active_jobs.fetch_add(1, Ordering::Release);
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = ActiveJobGuard { inner };

        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            let msg = e
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| e.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("(non-string panic)");
            error!(target: "cachesnap::snapshot", panic = msg, "Snapshot job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Barrier;

    #[test]
    fn test_submit_and_drain() {
        let worker = SnapshotWorker::spawn().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let c = Arc::clone(&counter);
            worker
                .submit(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }

        worker.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert_eq!(worker.stats().jobs_completed, 10);
        worker.shutdown();
    }

    #[test]
    fn test_fifo_order() {
        let worker = SnapshotWorker::spawn().unwrap();

        // Hold the worker so the following jobs queue up
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        worker.submit(move || {
            b.wait();
        })
        .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let o = Arc::clone(&order);
            worker.submit(move || o.lock().push(i)).unwrap();
        }

        barrier.wait();
        worker.drain();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        worker.shutdown();
    }

    #[test]
    fn test_runs_on_named_thread() {
        let worker = SnapshotWorker::spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        worker
            .submit(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })
            .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some(WORKER_THREAD_NAME));
    }

    #[test]
    fn test_shutdown_runs_remaining_jobs() {
        let worker = SnapshotWorker::spawn().unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        worker.submit(move || {
            b.wait();
        })
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            worker
                .submit(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }

        barrier.wait();
        worker.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let worker = SnapshotWorker::spawn().unwrap();
        worker.shutdown();
        assert!(worker.is_shut_down());
        assert!(matches!(
            worker.submit(|| {}),
            Err(SnapshotError::WorkerUnavailable)
        ));
    }

    #[test]
    fn test_job_panic_does_not_kill_worker() {
        let worker = SnapshotWorker::spawn().unwrap();
        worker.submit(|| panic!("intentional test panic")).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        worker
            .submit(move || {
                c.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        worker.drain();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(worker.stats().jobs_completed, 2);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let worker = SnapshotWorker::spawn().unwrap();
        worker.submit(|| {}).unwrap();
        worker.shutdown();
        worker.shutdown();
        drop(worker);
    }
}
