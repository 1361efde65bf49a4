//! The shared compile worker pool (spec.md §5: "multi-threaded with cooperative
//! job dispatch ... jobs are plain functions queued to workers").
//!
//! Grounded in `compile/project.rs`'s `rayon::ThreadPoolBuilder` usage for
//! parallel compilation, generalized from "compile every input in one batch"
//! to "enqueue one job per `InvokeCompile` call, at any time".

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};

struct Inner {
    pool: rayon::ThreadPool,
    pending: AtomicUsize,
    drain: (Mutex<()>, Condvar),
    cancelled: AtomicBool,
}

/// Wraps a `rayon::ThreadPool` with the bookkeeping `StallOnPendingOperations`
/// needs (spec.md §5, SPEC_FULL.md §11): a pending-job counter and a coarse
/// cancellation flag jobs are expected to check before starting.
#[derive(Clone)]
pub struct WorkerPool(Arc<Inner>);

impl WorkerPool {
    pub fn new(num_threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(|i| format!("intermediate-compilers-worker-{i}"))
            .build()
            .expect("failed to build compile worker pool");
        Self(Arc::new(Inner {
            pool,
            pending: AtomicUsize::new(0),
            drain: (Mutex::new(()), Condvar::new()),
            cancelled: AtomicBool::new(false),
        }))
    }

    /// Enqueues a compile job. If the pool has been cancelled via
    /// `stall_on_pending_operations(true)`, the job is dropped without running
    /// (spec.md §5: "cancelAll=true additionally signals workers to abort between
    /// jobs, not mid-job").
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let inner = self.0.clone();
        inner.pending.fetch_add(1, Ordering::SeqCst);
        self.0.pool.spawn(move || {
            if !inner.cancelled.load(Ordering::SeqCst) {
                job();
            }
            if inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                let _guard = inner.drain.0.lock().unwrap();
                inner.drain.1.notify_all();
            }
        });
    }

    /// `StallOnPendingOperations(cancelAll)` (SPEC_FULL.md §11): waits for the
    /// queue to drain. `cancel_all = true` additionally sets the cancellation flag
    /// so queued-but-not-yet-started jobs are skipped.
    pub fn stall_on_pending_operations(&self, cancel_all: bool) {
        if cancel_all {
            self.0.cancelled.store(true, Ordering::SeqCst);
        }
        let guard = self.0.drain.0.lock().unwrap();
        let _guard = self
            .0
            .drain
            .1
            .wait_while(guard, |_| self.0.pending.load(Ordering::SeqCst) != 0)
            .unwrap();
    }

    pub fn pending_count(&self) -> usize {
        self.0.pending.load(Ordering::SeqCst)
    }
}
