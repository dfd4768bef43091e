//! Runnable dispatch.
//!
//! Every inbound event reaches user code through an [`Executor`]. The
//! scheduling model is chosen at construction through [`ExecutorKind`]:
//!
//! - [`Inline`] runs the task on the caller.
//! - [`PerTask`] starts a thread per task.
//! - [`SingleWorker`] runs tasks in FIFO order on one thread.
//! - [`Pooled`] runs tasks on up to `n` threads with no ordering across them.
//! - [`Hashed`] routes a task to worker `index mod n`, so tasks sharing an
//!   index run in FIFO order.
//!
//! Tasks that panic are logged and dropped; the worker survives.

use std::{
    collections::VecDeque,
    fmt, io,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use serde::Deserialize;
use thiserror::Error;

use crate::panic::format_panic;

/// Errors returned by [`Executor::post`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The executor no longer accepts work.
    #[error("executor is shut down")]
    Shutdown,
    /// A worker thread could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
}

/// A unit of work with an optional ordering index.
pub struct Task {
    index: Option<u64>,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    /// Wrap a closure with no ordering index.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            index: None,
            run: Box::new(f),
        }
    }

    /// Wrap a closure that must run in order with others sharing `index`.
    pub fn with_index(index: u64, f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            index: Some(index),
            run: Box::new(f),
        }
    }

    /// Ordering index used by [`Hashed`].
    #[must_use]
    pub fn index(&self) -> Option<u64> { self.index }

    /// Run the task, logging instead of unwinding if it panics.
    pub fn run(self) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(self.run)) {
            let panic_msg = format_panic(panic);
            tracing::error!(panic = %panic_msg, index = ?self.index, "task panicked");
            crate::metrics::inc_errors();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Something that runs tasks.
pub trait Executor: Send + Sync {
    /// Schedule `task`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError`] if the task cannot be accepted.
    fn post(&self, task: Task) -> Result<(), ExecutorError>;

    /// Stop accepting new tasks. Queued tasks still run.
    fn shutdown(&self) {}
}

/// Runs each task on the posting thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Executor for Inline {
    fn post(&self, task: Task) -> Result<(), ExecutorError> {
        task.run();
        Ok(())
    }
}

/// Starts a named thread per task.
#[derive(Clone, Debug)]
pub struct PerTask {
    name: String,
}

impl Default for PerTask {
    fn default() -> Self {
        Self {
            name: "kgnet-task".into(),
        }
    }
}

impl Executor for PerTask {
    fn post(&self, task: Task) -> Result<(), ExecutorError> {
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || task.run())?;
        Ok(())
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl Queue {
    fn worker_loop(&self) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    if state.closed {
                        return;
                    }
                    state = self
                        .ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };
            task.run();
        }
    }
}

/// One worker thread draining an unbounded FIFO queue.
pub struct SingleWorker {
    queue: Arc<Queue>,
}

impl SingleWorker {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Spawn`] if the thread cannot be started.
    pub fn new(name: &str) -> Result<Self, ExecutorError> {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        });
        let worker = Arc::clone(&queue);
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker.worker_loop())?;
        Ok(Self { queue })
    }

    /// Tasks waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .len()
    }
}

impl Executor for SingleWorker {
    fn post(&self, task: Task) -> Result<(), ExecutorError> {
        let mut state = self
            .queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(ExecutorError::Shutdown);
        }
        state.tasks.push_back(task);
        drop(state);
        self.queue.ready.notify_one();
        Ok(())
    }

    fn shutdown(&self) {
        self.queue
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.queue.ready.notify_all();
    }
}

impl Drop for SingleWorker {
    fn drop(&mut self) { self.shutdown(); }
}

impl fmt::Debug for SingleWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleWorker")
            .field("pending", &self.pending())
            .finish()
    }
}

struct PoolState {
    tasks: VecDeque<Task>,
    workers: usize,
    closed: bool,
}

/// Up to `max_workers` threads; idle workers exit once the queue is empty.
pub struct Pooled {
    max_workers: usize,
    state: Arc<Mutex<PoolState>>,
}

impl Pooled {
    /// Create a pool allowing `max_workers` concurrent threads.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            state: Arc::new(Mutex::new(PoolState {
                tasks: VecDeque::new(),
                workers: 0,
                closed: false,
            })),
        }
    }

    /// Threads currently running.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .workers
    }

    fn drain(state: &Mutex<PoolState>, first: Task) {
        first.run();
        loop {
            let next = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                let next = guard.tasks.pop_front();
                if next.is_none() {
                    guard.workers -= 1;
                }
                next
            };
            match next {
                Some(task) => task.run(),
                None => return,
            }
        }
    }
}

impl Executor for Pooled {
    fn post(&self, task: Task) -> Result<(), ExecutorError> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.closed {
            return Err(ExecutorError::Shutdown);
        }
        if guard.workers >= self.max_workers {
            guard.tasks.push_back(task);
            return Ok(());
        }
        guard.workers += 1;
        drop(guard);
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("kgnet-pool".into())
            .spawn(move || Self::drain(&state, task));
        if let Err(e) = spawned {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .workers -= 1;
            return Err(e.into());
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
    }
}

impl fmt::Debug for Pooled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("max_workers", &self.max_workers)
            .field("workers", &self.workers())
            .finish()
    }
}

/// `n` single workers selected by task index.
///
/// Tasks without an index are spread round-robin.
#[derive(Debug)]
pub struct Hashed {
    workers: Vec<SingleWorker>,
    next: AtomicUsize,
}

impl Hashed {
    /// Start `n` workers.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Spawn`] if a worker thread cannot be started.
    pub fn new(n: usize) -> Result<Self, ExecutorError> {
        let workers = (0..n.max(1))
            .map(|i| SingleWorker::new(&format!("kgnet-hashed-{i}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    fn pick(&self, index: Option<u64>) -> &SingleWorker {
        let n = self.workers.len();
        let slot = match index {
            Some(index) => usize::try_from(index % n as u64).unwrap_or(0),
            None => self.next.fetch_add(1, Ordering::Relaxed) % n,
        };
        &self.workers[slot]
    }
}

impl Executor for Hashed {
    fn post(&self, task: Task) -> Result<(), ExecutorError> { self.pick(task.index()).post(task) }

    fn shutdown(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}

/// Scheduling model selected in configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Run on the caller.
    Inline,
    /// One thread per task.
    PerTask,
    /// One worker, FIFO.
    Single,
    /// Up to `workers` threads.
    Pooled {
        /// Maximum concurrent threads.
        workers: usize,
    },
    /// `workers` FIFO workers selected by task index.
    Hashed {
        /// Number of workers.
        workers: usize,
    },
}

impl Default for ExecutorKind {
    fn default() -> Self {
        Self::Pooled {
            workers: thread::available_parallelism().map_or(4, NonZeroUsize::get),
        }
    }
}

impl ExecutorKind {
    /// Construct the executor.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Spawn`] if worker threads cannot be started.
    pub fn build(self) -> Result<Arc<dyn Executor>, ExecutorError> {
        Ok(match self {
            Self::Inline => Arc::new(Inline),
            Self::PerTask => Arc::new(PerTask::default()),
            Self::Single => Arc::new(SingleWorker::new("kgnet-single")?),
            Self::Pooled { workers } => Arc::new(Pooled::new(workers)),
            Self::Hashed { workers } => Arc::new(Hashed::new(workers)?),
        })
    }
}
