//! A shared pool of OS threads that processes reference-counted work items.
//!
//! [ThreadPool] is independent of any single [crate::queue::TaskQueue]: many subsystems can
//! enqueue [WorkItem]s onto the same pool. Items are started in the order they were enqueued and
//! move through [State::Queued], [State::Started], and [State::Completed]. After
//! [WorkItem::process] returns, [WorkItem::on_completed] runs on the same pool thread.
//!
//! Long-running items can poll [ThreadPool::should_yield] to find out whether other items are
//! waiting for a thread. The hint is advisory: nothing is ever preempted.
//!
//! # Example
//!
//! ```rust
//! use ringwork_dispatch::pool::{Config, Signaled, ThreadPool, WorkItem};
//! use std::{num::NonZeroUsize, sync::Arc};
//!
//! struct Hello;
//!
//! impl WorkItem for Hello {
//!     fn process(self: Arc<Self>, _pool: &ThreadPool) {
//!         println!("hello from the pool");
//!     }
//! }
//!
//! let pool = ThreadPool::new(Config {
//!     name: "pool".into(),
//!     workers: NonZeroUsize::new(2).unwrap(),
//! })
//! .unwrap();
//!
//! // Block until the item has been processed
//! let item = Signaled::new(Hello);
//! pool.enqueue(item.clone());
//! item.wait();
//! ```

use crate::{panic_message, Error};
use rayon::{ThreadPool as RThreadPool, ThreadPoolBuilder};
use std::{
    collections::VecDeque,
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
};
use tracing::{debug, error};

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const COMPLETED: u8 = 2;

/// Configuration for a [ThreadPool].
#[derive(Clone, Debug)]
pub struct Config {
    /// Prefix for the names of the pool's threads (`{name}-{index}`).
    pub name: String,

    /// Number of OS threads servicing the pool.
    pub workers: NonZeroUsize,
}

/// Progress of a [WorkItem] through the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Waiting for a thread.
    Queued,
    /// [WorkItem::process] is running.
    Started,
    /// [WorkItem::process] and [WorkItem::on_completed] have returned.
    Completed,
}

/// A unit of work that can be enqueued on a [ThreadPool].
///
/// Items are reference-counted: the pool holds its own reference until the item completes, so
/// the submitter may drop (or keep) its handle at any time.
pub trait WorkItem: Send + Sync + 'static {
    /// Perform the work.
    fn process(self: Arc<Self>, pool: &ThreadPool);

    /// Invoked on the pool thread immediately after [WorkItem::process] returns (or panics).
    fn on_completed(&self) {}
}

/// Observes the [State] of an enqueued [WorkItem].
#[derive(Clone, Debug)]
pub struct Handle {
    state: Arc<AtomicU8>,
}

impl Handle {
    /// Current state of the item.
    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            QUEUED => State::Queued,
            STARTED => State::Started,
            _ => State::Completed,
        }
    }
}

struct Entry {
    item: Arc<dyn WorkItem>,
    state: Arc<AtomicU8>,
}

struct Inner {
    name: String,
    threads: RThreadPool,
    queue: Mutex<VecDeque<Entry>>,
    pending: AtomicUsize,
}

/// A clone-able handle to a shared pool of worker threads.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<Inner>,
}

impl ThreadPool {
    /// Start a pool with the given configuration.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        let prefix = cfg.name.clone();
        let threads = ThreadPoolBuilder::new()
            .num_threads(cfg.workers.get())
            .thread_name(move |index| format!("{prefix}-{index}"))
            .build()?;
        debug!(name = %cfg.name, workers = cfg.workers.get(), "started thread pool");
        Ok(Self {
            inner: Arc::new(Inner {
                name: cfg.name,
                threads,
                queue: Mutex::new(VecDeque::new()),
                pending: AtomicUsize::new(0),
            }),
        })
    }

    /// Name of the pool.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of threads servicing the pool.
    pub fn workers(&self) -> usize {
        self.inner.threads.current_num_threads()
    }

    /// Number of items waiting for a thread.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Returns `true` if other items are waiting for a thread.
    ///
    /// Long-running items may use this to return early and re-enqueue themselves.
    pub fn should_yield(&self) -> bool {
        self.pending() > 0
    }

    /// Append an item to the pool and wake an idle thread to process it.
    pub fn enqueue(&self, item: Arc<dyn WorkItem>) -> Handle {
        let state = Arc::new(AtomicU8::new(QUEUED));
        self.inner.queue.lock().unwrap().push_back(Entry {
            item,
            state: state.clone(),
        });
        self.inner.pending.fetch_add(1, Ordering::AcqRel);

        // Each spawned job runs exactly one entry (the oldest), so items start in FIFO order
        let pool = self.clone();
        self.inner.threads.spawn(move || pool.run_next());
        Handle { state }
    }

    /// Enqueue a closure.
    pub fn spawn<F>(&self, f: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Arc::new(Closure(Mutex::new(Some(f)))))
    }

    fn run_next(&self) {
        let Some(entry) = self.inner.queue.lock().unwrap().pop_front() else {
            return;
        };
        self.inner.pending.fetch_sub(1, Ordering::AcqRel);

        entry.state.store(STARTED, Ordering::Release);
        let item = entry.item.clone();
        if let Err(err) = panic::catch_unwind(AssertUnwindSafe(|| item.process(self))) {
            error!(
                pool = %self.inner.name,
                message = panic_message(err.as_ref()),
                "work item panicked"
            );
        }
        entry.item.on_completed();
        entry.state.store(COMPLETED, Ordering::Release);
    }
}

/// Adapts a closure to [WorkItem].
struct Closure<F>(Mutex<Option<F>>);

impl<F: FnOnce() + Send + 'static> WorkItem for Closure<F> {
    fn process(self: Arc<Self>, _pool: &ThreadPool) {
        let f = self.0.lock().unwrap().take();
        if let Some(f) = f {
            f();
        }
    }
}

/// Wraps a [WorkItem] so callers can block until the pool has completed it.
pub struct Signaled<W> {
    item: Arc<W>,
    completed: Mutex<bool>,
    cv: Condvar,
}

impl<W: WorkItem> Signaled<W> {
    /// Wrap `item`.
    pub fn new(item: W) -> Arc<Self> {
        Arc::new(Self {
            item: Arc::new(item),
            completed: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// The wrapped item.
    pub fn inner(&self) -> &W {
        &self.item
    }

    /// Returns `true` once [WorkItem::on_completed] has run.
    pub fn is_completed(&self) -> bool {
        *self.completed.lock().unwrap()
    }

    /// Block until [WorkItem::on_completed] has run on the pool thread.
    pub fn wait(&self) {
        let mut completed = self.completed.lock().unwrap();
        while !*completed {
            completed = self.cv.wait(completed).unwrap();
        }
    }
}

impl<W: WorkItem> WorkItem for Signaled<W> {
    fn process(self: Arc<Self>, pool: &ThreadPool) {
        self.item.clone().process(pool);
    }

    fn on_completed(&self) {
        self.item.on_completed();
        *self.completed.lock().unwrap() = true;
        self.cv.notify_all();
    }
}
