//! A reusable rendezvous for a fixed number of participants.
//!
//! [Barrier] blocks callers of [Barrier::wait] until the configured number of participants have
//! arrived and then releases all of them together. Each round passes through two phases, each
//! guarded by its own turnstile:
//!
//! 1. **Entry**: arrivals are counted; the last arrival opens the entry turnstile for everyone.
//! 2. **Exit**: departures are counted; the last departure opens the exit turnstile for everyone.
//!
//! A participant can only start the next round after every participant of the current round has
//! left the entry phase, so no participant can "lap" the others and consume a release meant for
//! the round it just finished.

use std::sync::{Arc, Condvar, Mutex};

/// A counting gate that threads block on until permits are released.
struct Turnstile {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Turnstile {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn release(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        self.cv.notify_all();
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap();
        }
        *permits -= 1;
    }
}

struct State {
    participants: usize,
    /// Participants that have entered the current round and not yet left the entry phase.
    arrived: usize,
    /// Participants currently inside [Barrier::wait].
    inside: usize,
}

/// A two-phase barrier for a fixed number of participants.
pub struct Barrier {
    state: Mutex<State>,
    entry: Turnstile,
    exit: Turnstile,
}

impl Barrier {
    /// Create a barrier that releases waiters in groups of `participants`.
    ///
    /// # Panics
    ///
    /// Panics if `participants` is zero.
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "barrier requires at least one participant");
        Self {
            state: Mutex::new(State {
                participants,
                arrived: 0,
                inside: 0,
            }),
            entry: Turnstile::new(),
            exit: Turnstile::new(),
        }
    }

    /// Number of participants released per round.
    pub fn participants(&self) -> usize {
        self.state.lock().unwrap().participants
    }

    /// Number of callers currently blocked in (or passing through) [Barrier::wait].
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap().inside
    }

    /// Change the number of participants for subsequent rounds.
    ///
    /// # Panics
    ///
    /// Panics if any caller is inside [Barrier::wait].
    pub fn set_participants(&self, participants: usize) {
        assert!(participants > 0, "barrier requires at least one participant");
        let mut state = self.state.lock().unwrap();
        let inside = state.inside;
        if inside > 0 {
            // Release the lock first so the barrier stays usable by the current round
            drop(state);
            panic!("cannot change participants while {inside} waits are in progress");
        }
        state.participants = participants;
    }

    /// Block until all participants have called `wait`.
    ///
    /// Returns `true` for exactly one caller per round: the one whose arrival released the others.
    pub fn wait(&self) -> bool {
        // Entry phase
        let (participants, leader) = {
            let mut state = self.state.lock().unwrap();
            state.inside += 1;
            state.arrived += 1;
            let leader = state.arrived == state.participants;
            if leader {
                self.entry.release(state.participants);
            }
            (state.participants, leader)
        };
        self.entry.acquire();

        // Exit phase
        {
            let mut state = self.state.lock().unwrap();
            state.arrived -= 1;
            if state.arrived == 0 {
                self.exit.release(participants);
            }
        }
        self.exit.acquire();

        self.state.lock().unwrap().inside -= 1;
        leader
    }
}

/// Recycles two-participant barriers used to hand a single task from a producer to a consumer.
pub(crate) struct BarrierPool {
    free: Vec<Arc<Barrier>>,
    outstanding: usize,
}

impl BarrierPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Vec::new(),
            outstanding: 0,
        }
    }

    /// Borrow a barrier (creating one if none are idle).
    pub(crate) fn acquire(&mut self) -> Arc<Barrier> {
        self.outstanding += 1;
        self.free.pop().unwrap_or_else(|| Arc::new(Barrier::new(2)))
    }

    /// Return a barrier previously obtained from [BarrierPool::acquire].
    pub(crate) fn release(&mut self, barrier: Arc<Barrier>) {
        assert!(
            self.outstanding > 0,
            "returned a barrier the pool does not own"
        );
        assert_eq!(barrier.participants(), 2, "returned a foreign barrier");
        self.outstanding -= 1;
        self.free.push(barrier);
    }

    /// Barriers currently borrowed.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Barriers ready for reuse.
    pub(crate) fn idle(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringwork_macros::test_traced;
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
        time::Duration,
    };
    use test_case::test_case;

    #[test]
    fn test_single_participant() {
        let barrier = Barrier::new(1);
        assert!(barrier.wait());
        assert!(barrier.wait());
        assert_eq!(barrier.waiting(), 0);
    }

    #[test]
    #[should_panic(expected = "at least one participant")]
    fn test_zero_participants() {
        Barrier::new(0);
    }

    #[test_traced(timeout = 30)]
    fn test_blocks_until_last_arrival() {
        let barrier = Arc::new(Barrier::new(2));
        let released = Arc::new(AtomicBool::new(false));

        let handle = thread::spawn({
            let barrier = barrier.clone();
            let released = released.clone();
            move || {
                barrier.wait();
                released.store(true, Ordering::SeqCst);
            }
        });

        // The first participant stays blocked
        while barrier.waiting() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));

        // The second arrival releases both
        barrier.wait();
        handle.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test_case(2, 1; "pair single round")]
    #[test_case(2, 100; "pair many rounds")]
    #[test_case(4, 50; "four many rounds")]
    #[test_case(8, 20; "eight many rounds")]
    fn test_rounds(participants: usize, rounds: usize) {
        let barrier = Arc::new(Barrier::new(participants));
        let arrivals = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..participants)
            .map(|_| {
                let barrier = barrier.clone();
                let arrivals = arrivals.clone();
                let leaders = leaders.clone();
                thread::spawn(move || {
                    for round in 1..=rounds {
                        arrivals.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }

                        // Never released before everyone in this round arrived, and no one can
                        // arrive more than one round ahead
                        let seen = arrivals.load(Ordering::SeqCst);
                        assert!(seen >= round * participants);
                        assert!(seen <= (round + 1) * participants);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(arrivals.load(Ordering::SeqCst), rounds * participants);
        assert_eq!(leaders.load(Ordering::SeqCst), rounds);
        assert_eq!(barrier.waiting(), 0);
    }

    #[test_traced(timeout = 30)]
    fn test_set_participants_mid_wait() {
        let barrier = Arc::new(Barrier::new(2));
        let handle = thread::spawn({
            let barrier = barrier.clone();
            move || barrier.wait()
        });
        while barrier.waiting() == 0 {
            thread::yield_now();
        }

        // Reconfiguring while a participant waits is rejected
        let result = panic::catch_unwind(AssertUnwindSafe(|| barrier.set_participants(3)));
        assert!(result.is_err());
        assert_eq!(barrier.participants(), 2);

        // The round still completes
        barrier.wait();
        handle.join().unwrap();

        // Once idle, reconfiguration is allowed
        barrier.set_participants(1);
        assert!(barrier.wait());
    }

    #[test]
    fn test_pool_recycles() {
        let mut pool = BarrierPool::new();
        let first = pool.acquire();
        let second = pool.acquire();
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(first.participants(), 2);

        pool.release(first);
        pool.release(second.clone());
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 2);

        // Reuse the most recently returned barrier instead of allocating
        let again = pool.acquire();
        assert!(Arc::ptr_eq(&again, &second));
        assert_eq!(pool.idle(), 1);
        pool.release(again);
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn test_pool_rejects_unowned() {
        let mut pool = BarrierPool::new();
        pool.release(Arc::new(Barrier::new(2)));
    }
}
