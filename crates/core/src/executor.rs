use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::{
    fmt, io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

/// Result of attempting to enqueue a task.
///
/// # Example
/// ```rust
/// use focus_core::prelude::{SendOutcome, TaskExecutor};
///
/// let exec = TaskExecutor::serial("doc", 1).unwrap();
/// assert_eq!(exec.handle().execute(|| {}), SendOutcome::Ok);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Task was accepted.
    Ok,
    /// Queue is full.
    Full,
    /// Executor has been shut down.
    Closed,
}

impl SendOutcome {
    pub fn is_ok(self) -> bool {
        matches!(self, SendOutcome::Ok)
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Default bound on queued tasks per executor.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

struct ExecutorInner {
    name: String,
    queue: ArrayQueue<Task>,
    closed: AtomicBool,
    park: Mutex<()>,
    wake: Condvar,
    workers: Mutex<Vec<ThreadId>>,
    executed: AtomicU64,
    panicked: AtomicU64,
}

impl ExecutorInner {
    fn worker_loop(&self) {
        loop {
            if let Some(task) = self.queue.pop() {
                self.run(task);
                continue;
            }
            let mut guard = self.park.lock();
            if !self.queue.is_empty() {
                continue;
            }
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            self.wake.wait(&mut guard);
        }
    }

    fn run(&self, task: Task) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!(executor = %self.name, "task panicked");
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_worker(&self) -> bool {
        let current = thread::current().id();
        self.workers.lock().contains(&current)
    }
}

/// Cloneable handle used to post work onto a [`TaskExecutor`].
///
/// Handles never keep worker threads alive; once the owning executor shuts
/// down every post reports [`SendOutcome::Closed`].
#[derive(Clone)]
pub struct ExecutorHandle {
    inner: Arc<ExecutorInner>,
}

impl ExecutorHandle {
    /// Queue `task` without blocking.
    pub fn execute<F>(&self, task: F) -> SendOutcome
    where
        F: FnOnce() + Send + 'static,
    {
        // Workers only exit under `park` with the queue empty and `closed` set,
        // so a push made under the same lock is always drained.
        let _guard = self.inner.park.lock();
        if self.inner.closed.load(Ordering::Acquire) {
            return SendOutcome::Closed;
        }
        if self.inner.queue.push(Box::new(task)).is_err() {
            tracing::warn!(executor = %self.inner.name, "executor queue full");
            return SendOutcome::Full;
        }
        self.inner.wake.notify_one();
        SendOutcome::Ok
    }

    /// True when called from one of this executor's worker threads.
    pub fn is_current(&self) -> bool {
        self.inner.on_worker()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Tasks run so far, including those that panicked.
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.inner.panicked.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Owned pool of worker threads draining a bounded task queue.
///
/// A serial executor (one worker) runs tasks in submission order. Dropping
/// the executor closes the queue, lets the workers drain what was already
/// accepted, and joins them.
///
/// # Example
/// ```rust
/// use std::sync::mpsc;
/// use focus_core::prelude::TaskExecutor;
///
/// let exec = TaskExecutor::pool("doc-pool", 2, 16).unwrap();
/// let (tx, rx) = mpsc::channel();
/// exec.handle().execute(move || tx.send(7).unwrap());
/// assert_eq!(rx.recv().unwrap(), 7);
/// ```
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutor {
    /// Single worker; tasks run one at a time in order.
    pub fn serial(name: impl Into<String>, depth: usize) -> io::Result<Self> {
        Self::pool(name, 1, depth)
    }

    /// `threads` workers sharing one queue of `depth` tasks.
    pub fn pool(name: impl Into<String>, threads: usize, depth: usize) -> io::Result<Self> {
        let name = name.into();
        let inner = Arc::new(ExecutorInner {
            name: name.clone(),
            queue: ArrayQueue::new(depth.max(1)),
            closed: AtomicBool::new(false),
            park: Mutex::new(()),
            wake: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });
        let exec = Self {
            inner: inner.clone(),
            threads: Mutex::new(Vec::new()),
        };
        for idx in 0..threads.max(1) {
            let worker = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || worker.worker_loop())?;
            inner.workers.lock().push(handle.thread().id());
            exec.threads.lock().push(handle);
        }
        tracing::debug!(executor = %name, threads = threads.max(1), depth, "executor started");
        Ok(exec)
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            inner: self.inner.clone(),
        }
    }

    /// Stop accepting work, run what is queued, and join the workers.
    ///
    /// When invoked from one of this executor's own workers the join is
    /// skipped; the remaining workers exit once the queue drains.
    pub fn shutdown(&self) {
        {
            let _guard = self.inner.park.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            self.inner.wake.notify_all();
        }
        if self.inner.on_worker() {
            tracing::debug!(executor = %self.inner.name, "shutdown from worker; not joining");
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::warn!(executor = %self.inner.name, "worker exited by panic");
            }
        }
        tracing::debug!(executor = %self.inner.name, "executor stopped");
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn serial_executor_preserves_order() {
        let exec = TaskExecutor::serial("order", 64).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let seen = seen.clone();
            assert_eq!(exec.handle().execute(move || seen.lock().push(i)), SendOutcome::Ok);
        }
        exec.shutdown();
        assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let exec = TaskExecutor::serial("closed", 4).unwrap();
        let handle = exec.handle();
        drop(exec);
        assert_eq!(handle.execute(|| {}), SendOutcome::Closed);
        assert!(handle.is_closed());
    }

    #[test]
    fn accepted_tasks_run_even_when_racing_shutdown() {
        for round in 0..20 {
            let exec = TaskExecutor::pool(format!("race-{round}"), 2, 4096).unwrap();
            let ran = Arc::new(AtomicU64::new(0));
            let posters: Vec<_> = (0..4)
                .map(|_| {
                    let handle = exec.handle();
                    let ran = ran.clone();
                    thread::spawn(move || {
                        let mut accepted = 0u64;
                        for _ in 0..200 {
                            let ran = ran.clone();
                            let outcome = handle.execute(move || {
                                ran.fetch_add(1, Ordering::Relaxed);
                            });
                            if outcome.is_ok() {
                                accepted += 1;
                            }
                        }
                        accepted
                    })
                })
                .collect();
            exec.shutdown();
            let accepted: u64 = posters.into_iter().map(|p| p.join().unwrap()).sum();
            assert_eq!(ran.load(Ordering::Relaxed), accepted);
            assert_eq!(exec.handle().pending(), 0);
        }
    }

    #[test]
    fn full_queue_reports_backpressure() {
        let exec = TaskExecutor::serial("full", 1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        exec.handle().execute(move || {
            started_tx.send(()).unwrap();
            let _ = gate_rx.recv();
        });
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(exec.handle().execute(|| {}), SendOutcome::Ok);
        assert_eq!(exec.handle().execute(|| {}), SendOutcome::Full);
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let exec = TaskExecutor::serial("panic", 4).unwrap();
        let handle = exec.handle();
        handle.execute(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        handle.execute(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.panicked(), 1);
    }

    #[test]
    fn worker_knows_its_executor() {
        let exec = TaskExecutor::serial("current", 4).unwrap();
        let handle = exec.handle();
        let (tx, rx) = mpsc::channel();
        let inner = handle.clone();
        handle.execute(move || tx.send(inner.is_current()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!handle.is_current());
    }
}
