//! A bounded, multi-producer/multi-consumer task queue.
//!
//! [TaskQueue] stores submitted tasks as records in a [crate::bip::CircularBuffer] and hands them
//! to consumers in submission order. Consumers are either threads owned by the queue
//! ([Mode::Dedicated]) or wrapper work items enqueued on a shared [ThreadPool] ([Mode::Shared]).
//!
//! # Lifecycle of a record
//!
//! A producer locks the queue, reserves a contiguous span for the record, moves the boxed payload
//! into it, and wakes an idle consumer. A consumer claims the oldest unclaimed record, releases
//! the lock, executes and drops the payload, then re-locks and marks the record finished.
//! Finished records are reclaimed strictly from the oldest end of the ring: a slow task at the
//! head keeps the space of every record behind it allocated, even if those already finished.
//!
//! # Backpressure
//!
//! When the ring has no contiguous span large enough for a record, the producer releases the
//! lock, yields, and tries again. There is no bound on retries. A queue without consumers drains
//! its backlog on the submitting thread instead (nothing else would ever make room).
//!
//! # Blocking submission
//!
//! [TaskQueue::queue_blocking] attaches a two-participant [crate::barrier::Barrier] to the record.
//! The consumer waits on it after running the payload, so the producer returns only once its task
//! has executed. Blocking submission is restricted to the thread that created the queue (unless
//! the queue has no consumers or the caller holds it paused, in which case the task simply runs on
//! the caller).
//!
//! # Synchronous queues
//!
//! A `queue_size` of zero disables queuing: every submission executes immediately on the
//! submitting thread.
//!
//! # Example
//!
//! ```rust
//! use ringwork_dispatch::queue::TaskQueue;
//! use std::sync::{
//!     atomic::{AtomicUsize, Ordering},
//!     Arc,
//! };
//!
//! let queue = TaskQueue::dedicated(4096, 2).unwrap();
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..100 {
//!     let counter = counter.clone();
//!     queue.queue_fn(move |_| {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     });
//! }
//!
//! // Wait for every task to finish
//! queue.exit_workers();
//! assert_eq!(counter.load(Ordering::SeqCst), 100);
//! ```

mod dispatcher;
mod metrics;
mod record;
mod state;

pub use record::CELL_SIZE;

use crate::{panic_message, pool::ThreadPool, Error};
use dispatcher::{Dedicated, Dispatcher, Pooled};
use metrics::Metrics;
use prometheus_client::registry::Registry;
use record::{cells_for, Claim, Pending};
use state::{Phase, State};
use std::{
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{self, ThreadId},
};
use tracing::{debug, error, trace, warn};

/// Source of [TaskQueue::id].
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// How a [TaskQueue] executes its tasks.
#[derive(Clone)]
pub enum Mode {
    /// Spawn `workers` threads owned by the queue.
    ///
    /// With zero workers, tasks wait until [TaskQueue::execute_queued_tasks] is called.
    Dedicated { workers: usize },

    /// Borrow threads from a shared pool (one wrapper work item per pool thread).
    Shared {
        pool: ThreadPool,

        /// Re-enqueue a wrapper behind other pool jobs (after each task) when the pool has a
        /// backlog.
        yield_to_other_jobs: bool,
    },
}

/// Configuration for a [TaskQueue].
#[derive(Clone)]
pub struct Config {
    /// Label for worker threads (`{name}-{index}`) and log output.
    pub name: String,

    /// Size of the ring in bytes (rounded down to a multiple of [CELL_SIZE]).
    ///
    /// Zero disables queuing: tasks execute synchronously on the submitting thread.
    pub queue_size: usize,

    /// Execution strategy.
    pub mode: Mode,
}

/// A unit of work executed exactly once by a [TaskQueue].
///
/// The payload is dropped immediately after [Task::execute] returns (or unwinds).
pub trait Task: Send + 'static {
    fn execute(&mut self, ctx: &Context);
}

/// Adapts a closure to [Task].
struct FnTask<F>(Option<F>);

impl<F: FnOnce(&Context) + Send + 'static> Task for FnTask<F> {
    fn execute(&mut self, ctx: &Context) {
        if let Some(f) = self.0.take() {
            f(ctx);
        }
    }
}

/// Which consumer is executing a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consumer {
    /// A dedicated worker thread (by index).
    Worker(usize),
    /// A wrapper bound to a shared pool (by index).
    Pool(usize),
    /// The thread that called into the queue (synchronous queues, drains, and full zero-worker
    /// queues).
    Caller,
}

/// Passed to [Task::execute].
#[derive(Clone, Copy, Debug)]
pub struct Context {
    queue: u64,
    seq: u64,
    consumer: Consumer,
}

impl Context {
    /// Identifier of the queue executing the task.
    pub fn queue(&self) -> u64 {
        self.queue
    }

    /// Position of the task in the queue's submission order.
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// The consumer executing the task.
    pub fn consumer(&self) -> Consumer {
        self.consumer
    }
}

/// State shared between the queue handle and its consumers.
struct Inner {
    id: u64,
    name: String,
    origin: ThreadId,

    state: Mutex<State>,
    cv: Condvar,

    metrics: Metrics,
}

impl Inner {
    /// Execute and drop a payload, containing any panic.
    fn execute(&self, mut task: Box<dyn Task>, ctx: &Context) {
        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            task.execute(ctx);
            drop(task);
        }));
        if let Err(err) = result {
            self.metrics.panicked.inc();
            error!(
                queue = self.id,
                seq = ctx.seq,
                message = panic_message(err.as_ref()),
                "task panicked"
            );
        }
        self.metrics.executed.inc();
    }

    /// Run a claimed record with the lock released, then mark it finished.
    ///
    /// Returns with the lock held again.
    fn run<'a>(
        &'a self,
        state: MutexGuard<'a, State>,
        claim: Claim,
        consumer: Consumer,
    ) -> MutexGuard<'a, State> {
        self.metrics.busy.set(state.busy as i64);
        drop(state);

        let Claim {
            index,
            seq,
            task,
            barrier,
        } = claim;
        let ctx = Context {
            queue: self.id,
            seq,
            consumer,
        };
        self.execute(task, &ctx);

        let mut state = self.state.lock().unwrap();
        state.finish(index);
        self.metrics.busy.set(state.busy as i64);
        self.metrics.used_bytes.set(state.used_bytes() as i64);

        // Rendezvous with the blocked producer
        let Some(barrier) = barrier else {
            return state;
        };
        drop(state);
        barrier.wait();
        self.state.lock().unwrap()
    }

    /// Claim and run records on the calling thread until the ring is empty and no other consumer
    /// is executing a task.
    ///
    /// Returns with the lock held, along with whether anything was executed.
    fn drain<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        consumer: Consumer,
    ) -> (MutexGuard<'a, State>, bool) {
        let mut executed = false;
        loop {
            if let Some(claim) = state.claim() {
                state = self.run(state, claim, consumer);
                executed = true;
                continue;
            }
            if state.is_quiescent() {
                return (state, executed);
            }
            drop(state);
            thread::yield_now();
            state = self.state.lock().unwrap();
        }
    }
}

/// A bounded queue that dispatches [Task]s to dedicated or pooled consumers.
pub struct TaskQueue {
    inner: Arc<Inner>,
    dispatcher: Box<dyn Dispatcher>,

    /// Ring capacity in cells (zero for a synchronous queue).
    cells: usize,
}

impl TaskQueue {
    /// Create a queue with the given configuration.
    ///
    /// The calling thread becomes the queue's origin thread (the only thread allowed to use
    /// [TaskQueue::queue_blocking] while the queue has consumers).
    pub fn new(cfg: Config) -> Result<Self, Error> {
        let cells = cfg.queue_size / CELL_SIZE;
        if cfg.queue_size > 0 && cells == 0 {
            return Err(Error::InvalidConfig("queue_size must be zero or at least one cell"));
        }
        let wrappers = match &cfg.mode {
            Mode::Shared { pool, .. } if cells > 0 => pool.workers(),
            _ => 0,
        };

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Inner {
            id,
            name: cfg.name,
            origin: thread::current().id(),
            state: Mutex::new(State::new(cells, wrappers)),
            cv: Condvar::new(),
            metrics: Metrics::default(),
        });

        let dispatcher: Box<dyn Dispatcher> = match cfg.mode {
            Mode::Dedicated { workers } if cells == 0 && workers > 0 => {
                warn!(queue = id, workers, "queue_size is zero: tasks run on the submitting thread");
                Box::new(Dedicated::none())
            }
            Mode::Shared { .. } if cells == 0 => {
                warn!(queue = id, "queue_size is zero: tasks run on the submitting thread");
                Box::new(Dedicated::none())
            }
            Mode::Dedicated { workers } => Box::new(Dedicated::spawn(&inner, workers)?),
            Mode::Shared {
                pool,
                yield_to_other_jobs,
            } => Box::new(Pooled::new(&inner, pool, yield_to_other_jobs)),
        };
        debug!(
            queue = id,
            name = %inner.name,
            bytes = cells * CELL_SIZE,
            consumers = dispatcher.consumers(),
            "initialized task queue"
        );
        Ok(Self {
            inner,
            dispatcher,
            cells,
        })
    }

    /// Create a queue served by `workers` dedicated threads.
    pub fn dedicated(queue_size: usize, workers: usize) -> Result<Self, Error> {
        Self::new(Config {
            name: "queue".into(),
            queue_size,
            mode: Mode::Dedicated { workers },
        })
    }

    /// Create a queue served by the threads of a shared pool.
    pub fn shared(
        pool: ThreadPool,
        queue_size: usize,
        yield_to_other_jobs: bool,
    ) -> Result<Self, Error> {
        Self::new(Config {
            name: "queue".into(),
            queue_size,
            mode: Mode::Shared {
                pool,
                yield_to_other_jobs,
            },
        })
    }

    /// Bytes of ring a task of type `T` occupies while queued.
    pub fn record_size<T: Task>() -> usize {
        cells_for::<T>() * CELL_SIZE
    }

    /// Process-unique identifier of the queue (see [Context::queue]).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of consumers (dedicated threads or pool wrappers).
    pub fn workers(&self) -> usize {
        self.dispatcher.consumers()
    }

    /// Returns `true` if tasks execute on the submitting thread.
    pub fn is_synchronous(&self) -> bool {
        self.cells == 0
    }

    /// Size of the ring in bytes.
    pub fn capacity(&self) -> usize {
        self.cells * CELL_SIZE
    }

    /// Bytes of the ring allocated to records.
    pub fn used(&self) -> usize {
        self.inner.state.lock().unwrap().used_bytes()
    }

    /// Bytes of the ring not allocated to records.
    pub fn free(&self) -> usize {
        self.inner.state.lock().unwrap().free_bytes()
    }

    /// Consumers currently executing a task.
    pub fn busy(&self) -> usize {
        self.inner.state.lock().unwrap().busy
    }

    /// Returns `true` if the ring is empty and no consumer is executing a task.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().unwrap().is_quiescent()
    }

    /// Register the queue's metrics.
    pub fn register(&self, registry: &mut Registry) {
        self.inner.metrics.register(registry);
    }

    /// Submit a task without waiting for it to run.
    ///
    /// Blocks (yielding) while the ring is full.
    ///
    /// # Panics
    ///
    /// Panics if the queue has shut down or if the record is larger than the whole ring.
    pub fn queue<T: Task>(&self, task: T) {
        self.submit(Box::new(task), cells_for::<T>());
    }

    /// Submit a closure without waiting for it to run.
    pub fn queue_fn<F>(&self, f: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.queue(FnTask(Some(f)));
    }

    /// Submit a task and block until it has executed.
    ///
    /// # Panics
    ///
    /// Panics if called from any thread other than the one that created the queue while the
    /// queue has consumers (and the caller does not hold it paused), and in the same cases as
    /// [TaskQueue::queue].
    pub fn queue_blocking<T: Task>(&self, task: T) {
        let cells = cells_for::<T>();
        if self.cells == 0 {
            self.run_inline(Box::new(task));
            return;
        }
        // Consumers cannot claim while this thread holds the queue paused
        let paused_here =
            self.inner.state.lock().unwrap().paused_by() == Some(thread::current().id());
        if self.dispatcher.consumers() == 0 || paused_here {
            self.submit(Box::new(task), cells);
            self.execute_queued_tasks();
            return;
        }
        assert_eq!(
            thread::current().id(),
            self.inner.origin,
            "blocking submission is only allowed from the thread that created the queue"
        );
        self.check_fits(cells);

        let mut state = self.lock_accepting();
        let barrier = state.barriers.acquire();
        let pending = Pending {
            task: Box::new(task),
            cells,
            barrier: Some(barrier.clone()),
        };
        drop(self.admit(state, pending));

        barrier.wait();
        self.inner.state.lock().unwrap().barriers.release(barrier);
    }

    /// Submit a closure and block until it has executed.
    pub fn queue_blocking_fn<F>(&self, f: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.queue_blocking(FnTask(Some(f)));
    }

    /// Claim and execute queued tasks on the calling thread until the ring is empty and no
    /// consumer is executing a task.
    ///
    /// Returns whether this call executed anything.
    pub fn execute_queued_tasks(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (_state, executed) = self.inner.drain(state, Consumer::Caller);
        executed
    }

    /// Wait until the ring is empty and no consumer is executing a task, then hold the queue
    /// until the returned guard is dropped.
    ///
    /// While paused, consumers cannot claim anything and submissions from other threads block.
    /// The pausing thread keeps full use of the queue: its submissions are admitted but stay
    /// pending until the queue resumes (or it drains them with
    /// [TaskQueue::execute_queued_tasks]). Pausing again from the same thread drains any such
    /// backlog on the caller and nests. A queue without consumers is drained on the calling thread.
    pub fn pause(&self) -> Paused<'_> {
        let me = thread::current().id();
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match state.paused_by() {
                Some(owner) if owner == me => {
                    state = self.inner.drain(state, Consumer::Caller).0;
                    state.hold(me);
                    return Paused::new(self);
                }
                None if state.is_quiescent() => {
                    state.hold(me);
                    debug!(queue = self.inner.id, "paused workers");
                    return Paused::new(self);
                }
                None if self.dispatcher.consumers() == 0 => {
                    state = self.inner.drain(state, Consumer::Caller).0;
                    continue;
                }
                _ => {}
            }
            drop(state);
            thread::yield_now();
            state = self.inner.state.lock().unwrap();
        }
    }

    /// Drop one pause guard, notifying consumers of any backlog once the queue resumes.
    fn resume(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.release() {
            return;
        }
        let backlog = state.queued().min(self.dispatcher.consumers());
        for _ in 0..backlog {
            self.dispatcher.notify(&self.inner, &mut state);
        }
        drop(state);
        self.inner.cv.notify_all();
        debug!(queue = self.inner.id, backlog, "resumed workers");
    }

    /// Drain the queue and stop every consumer.
    ///
    /// Subsequent calls do nothing. Submitting afterwards panics.
    pub fn exit_workers(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != Phase::Running {
                return;
            }
            state.phase = Phase::Draining;
        }

        // Tasks submitted while draining still run
        let paused = self.pause();
        self.inner.state.lock().unwrap().phase = Phase::ShuttingDown;
        paused.resume();

        self.dispatcher.stop(&self.inner);
        let mut state = self.inner.state.lock().unwrap();
        state.phase = Phase::Exited;
        debug!(
            queue = self.inner.id,
            idle_barriers = state.barriers.idle(),
            "exited workers"
        );
    }

    /// Lock the queue, panicking (without poisoning the lock) if it no longer accepts tasks.
    fn lock_accepting(&self) -> MutexGuard<'_, State> {
        let state = self.inner.state.lock().unwrap();
        if !state.accepting() {
            drop(state);
            panic!("cannot submit to a queue that has shut down");
        }
        state
    }

    fn check_fits(&self, cells: usize) {
        assert!(
            cells <= self.cells,
            "record of {} bytes exceeds queue capacity of {} bytes",
            cells * CELL_SIZE,
            self.capacity()
        );
    }

    fn submit(&self, task: Box<dyn Task>, cells: usize) {
        if self.cells == 0 {
            self.run_inline(task);
            return;
        }
        self.check_fits(cells);
        let state = self.lock_accepting();
        drop(self.admit(
            state,
            Pending {
                task,
                cells,
                barrier: None,
            },
        ));
    }

    /// Place a record in the ring, retrying until there is room, and notify a consumer.
    fn admit<'a>(
        &'a self,
        mut state: MutexGuard<'a, State>,
        mut pending: Pending,
    ) -> MutexGuard<'a, State> {
        loop {
            // Another thread holds the queue paused: wait for it to resume
            let held_elsewhere = state.held_elsewhere();
            if !held_elsewhere {
                match state.admit(pending) {
                    Ok(seq) => {
                        self.inner.metrics.submitted.inc();
                        self.inner
                            .metrics
                            .used_bytes
                            .set(state.used_bytes() as i64);
                        trace!(queue = self.inner.id, seq, "admitted record");

                        // Records admitted by the pausing thread wait for resume
                        if state.paused_by().is_none() {
                            self.dispatcher.notify(&self.inner, &mut state);
                        }
                        return state;
                    }
                    Err(rejected) => pending = rejected,
                }
                trace!(
                    queue = self.inner.id,
                    cells = pending.cells,
                    free = state.free_bytes(),
                    "queue full"
                );
            }
            if !held_elsewhere
                && (self.dispatcher.consumers() == 0 || state.paused_by().is_some())
            {
                // Nothing else will ever make room
                state = self.inner.drain(state, Consumer::Caller).0;
            } else {
                drop(state);
                thread::yield_now();
                state = self.inner.state.lock().unwrap();
            }
            if !state.accepting() {
                drop(state);
                panic!("cannot submit to a queue that has shut down");
            }
        }
    }

    /// Execute a task on the calling thread (synchronous queues).
    fn run_inline(&self, task: Box<dyn Task>) {
        let mut state = self.lock_accepting();
        while state.held_elsewhere() {
            drop(state);
            thread::yield_now();
            state = self.lock_accepting();
        }
        let seq = state.next_seq();
        drop(state);
        self.inner.metrics.submitted.inc();
        let ctx = Context {
            queue: self.inner.id,
            seq,
            consumer: Consumer::Caller,
        };
        self.inner.execute(task, &ctx);
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.exit_workers();
        if thread::panicking() {
            return;
        }
        let outstanding = self.inner.state.lock().unwrap().barriers.outstanding();
        assert_eq!(outstanding, 0, "queue dropped with {outstanding} barriers outstanding");
    }
}

/// Holds a [TaskQueue] paused until dropped (which resumes it).
///
/// The guard is tied to the thread that paused the queue.
pub struct Paused<'a> {
    queue: &'a TaskQueue,
    _thread: PhantomData<*const ()>,
}

impl<'a> Paused<'a> {
    fn new(queue: &'a TaskQueue) -> Self {
        Self {
            queue,
            _thread: PhantomData,
        }
    }

    /// Bytes of the ring allocated to records submitted while paused.
    pub fn used(&self) -> usize {
        self.queue.used()
    }

    /// Bytes of the ring not allocated to records.
    pub fn free(&self) -> usize {
        self.queue.free()
    }

    /// Consumers executing a task (zero unless this thread is draining).
    pub fn busy(&self) -> usize {
        self.queue.busy()
    }

    /// Returns `true` if nothing was submitted since the queue paused.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Submit a task that runs once the queue resumes.
    pub fn queue<T: Task>(&self, task: T) {
        self.queue.queue(task);
    }

    /// Submit a closure that runs once the queue resumes.
    pub fn queue_fn<F>(&self, f: F)
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.queue.queue_fn(f);
    }

    /// Resume the queue.
    pub fn resume(self) {}
}

impl Drop for Paused<'_> {
    fn drop(&mut self) {
        self.queue.resume();
    }
}
