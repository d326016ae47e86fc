//! Strategies for turning admitted records into work on some thread.
//!
//! A [super::TaskQueue] picks exactly one strategy when it is created:
//!
//! - [Dedicated]: a fixed set of OS threads owned by the queue, parked on the queue's condition
//!   variable when there is nothing to claim.
//! - [Pooled]: a fixed set of wrapper work items (one per thread of a shared
//!   [ThreadPool]) that are enqueued on the pool whenever there is a backlog and return to the
//!   pool once the ring has nothing left to claim.

use super::{
    state::{Phase, State},
    Consumer, Inner,
};
use crate::{
    pool::{ThreadPool, WorkItem},
    Error,
};
use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};
use tracing::{debug, error};

/// Dispatches admitted records to consumers.
pub(super) trait Dispatcher: Send + Sync {
    /// Maximum number of consumers that may execute tasks concurrently.
    fn consumers(&self) -> usize;

    /// Let idle capacity know a record was admitted.
    ///
    /// Called with the queue lock held.
    fn notify(&self, inner: &Inner, state: &mut State);

    /// Wait for every consumer to observe the exit phase and stop.
    ///
    /// Called without the queue lock.
    fn stop(&self, inner: &Inner);
}

/// Worker threads owned by the queue.
pub(super) struct Dedicated {
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dedicated {
    /// A strategy without any consumers (tasks wait for an explicit drain).
    pub fn none() -> Self {
        Self {
            workers: 0,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `workers` threads named `{name}-{index}`.
    pub fn spawn(inner: &Arc<Inner>, workers: usize) -> Result<Self, Error> {
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", inner.name))
                .spawn({
                    let inner = inner.clone();
                    move || work(inner, index)
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    error!(queue = inner.id, index, ?err, "failed to spawn worker");

                    // Tear down the workers that did start
                    inner.state.lock().unwrap().phase = Phase::ShuttingDown;
                    inner.cv.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::SpawnFailed(err));
                }
            }
        }
        debug!(queue = inner.id, workers, "spawned workers");
        Ok(Self {
            workers,
            handles: Mutex::new(handles),
        })
    }
}

impl Dispatcher for Dedicated {
    fn consumers(&self) -> usize {
        self.workers
    }

    fn notify(&self, inner: &Inner, state: &mut State) {
        if state.idle > 0 {
            inner.cv.notify_one();
        }
    }

    fn stop(&self, inner: &Inner) {
        inner.cv.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                error!(queue = inner.id, "worker panicked");
            }
        }
    }
}

/// Body of a dedicated worker thread.
fn work(inner: Arc<Inner>, index: usize) {
    let consumer = Consumer::Worker(index);
    let mut state = inner.state.lock().unwrap();
    loop {
        if let Some(claim) = state.claim() {
            state = inner.run(state, claim, consumer);
            continue;
        }
        if state.exiting() {
            break;
        }
        state.idle += 1;
        state = inner.cv.wait(state).unwrap();
        state.idle -= 1;
    }
    drop(state);
    debug!(queue = inner.id, index, "worker exited");
}

/// Wrapper work items bound to a shared [ThreadPool].
pub(super) struct Pooled {
    pool: ThreadPool,
    wrappers: Vec<Arc<Wrapper>>,
}

impl Pooled {
    /// Create one wrapper per thread of `pool`.
    pub fn new(inner: &Arc<Inner>, pool: ThreadPool, yield_to_other_jobs: bool) -> Self {
        let wrappers = (0..pool.workers())
            .map(|index| {
                Arc::new(Wrapper {
                    index,
                    inner: inner.clone(),
                    yield_to_other_jobs,
                })
            })
            .collect::<Vec<_>>();
        debug!(
            queue = inner.id,
            pool = pool.name(),
            wrappers = wrappers.len(),
            yield_to_other_jobs,
            "bound to thread pool"
        );
        Self { pool, wrappers }
    }
}

impl Dispatcher for Pooled {
    fn consumers(&self) -> usize {
        self.wrappers.len()
    }

    fn notify(&self, _inner: &Inner, state: &mut State) {
        let Some(index) = state.active.iter().position(|active| !active) else {
            // Every wrapper is already draining the ring
            return;
        };
        state.active[index] = true;
        self.pool.enqueue(self.wrappers[index].clone());
    }

    fn stop(&self, inner: &Inner) {
        loop {
            let active = {
                let state = inner.state.lock().unwrap();
                state.active.iter().filter(|active| **active).count()
            };
            if active == 0 {
                break;
            }
            thread::yield_now();
        }
        debug!(queue = inner.id, "released pool wrappers");
    }
}

/// Drains the ring from a pool thread.
struct Wrapper {
    index: usize,
    inner: Arc<Inner>,
    yield_to_other_jobs: bool,
}

impl WorkItem for Wrapper {
    fn process(self: Arc<Self>, pool: &ThreadPool) {
        let consumer = Consumer::Pool(self.index);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            let Some(claim) = state.claim() else {
                state.active[self.index] = false;
                return;
            };
            state = self.inner.run(state, claim, consumer);

            // Give the pool thread back to other jobs but stay active: the backlog is ours
            if self.yield_to_other_jobs && state.has_queued() && pool.should_yield() {
                drop(state);
                pool.enqueue(self.clone());
                return;
            }
        }
    }
}
