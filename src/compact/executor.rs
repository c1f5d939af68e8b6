//! Shared background executor for compaction tasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send>;

struct ExecutorInner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// A small fixed-size worker pool shared by every writer of a task.
///
/// Each writer submits at most one compaction at a time, so a pool sized to
/// the host's parallelism serves many buckets.
#[derive(Clone)]
pub struct CompactExecutor {
    inner: Arc<ExecutorInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CompactExecutor {
    /// Start a pool with the given number of worker threads.
    pub fn new(num_threads: usize) -> Self {
        let inner = Arc::new(ExecutorInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(num_threads.max(1));
        for i in 0..num_threads.max(1) {
            let inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tablestore-compact-{}", i))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn compaction worker");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Submit a job, returning a handle to its eventual result.
    pub fn submit<T, F>(&self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let state = Arc::new(HandleState {
            slot: Mutex::new(None),
            done: Condvar::new(),
        });
        let task_state = state.clone();

        let mut queue = self.inner.queue.lock();
        queue.push_back(Box::new(move || {
            let result = job();
            *task_state.slot.lock() = Some(result);
            task_state.done.notify_all();
        }));
        drop(queue);
        self.inner.available.notify_one();

        TaskHandle { state }
    }

    /// Stop accepting work and join every worker.
    ///
    /// Queued jobs that have not started are discarded.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        {
            let mut queue = self.inner.queue.lock();
            queue.clear();
            self.inner.available.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<ExecutorInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                inner.available.wait(&mut queue);
            }
        };
        job();
    }
}

struct HandleState<T> {
    slot: Mutex<Option<T>>,
    done: Condvar,
}

/// Handle to a submitted job's result.
pub struct TaskHandle<T> {
    state: Arc<HandleState<T>>,
}

impl<T> TaskHandle<T> {
    /// Take the result if the job has finished.
    pub fn try_take(&self) -> Option<T> {
        self.state.slot.lock().take()
    }

    /// Block until the job finishes and take its result.
    pub fn take(&self) -> T {
        let mut slot = self.state.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.state.done.wait(&mut slot);
        }
    }

    /// Check whether the result is ready without taking it.
    pub fn is_done(&self) -> bool {
        self.state.slot.lock().is_some()
    }
}
