//! Bookkeeping guarded by the queue lock.
//!
//! Every method here assumes the caller holds the lock (it takes `&mut State`), so none of them
//! ever acquire it again.

use super::record::{Claim, Pending, Record, CELL_SIZE};
use crate::{barrier::BarrierPool, bip::CircularBuffer};
use std::thread::{self, ThreadId};
use tracing::trace;

/// Lifecycle of a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Accepting and dispatching tasks.
    Running,
    /// Shutdown requested: waiting for the ring to empty.
    Draining,
    /// Consumers have been told to exit.
    ShuttingDown,
    /// All consumers are gone.
    Exited,
}

pub(crate) struct State {
    ring: CircularBuffer<Option<Record>>,
    next_seq: u64,

    /// Records admitted but not yet claimed.
    queued: usize,
    /// Consumers executing a claimed payload.
    pub busy: usize,

    /// Dedicated workers parked on the condition variable.
    pub idle: usize,
    /// Which shared-pool wrappers are enqueued on (or running in) the pool.
    pub active: Vec<bool>,

    /// Thread holding the queue paused and how many guards it holds.
    pause: Option<(ThreadId, usize)>,

    pub phase: Phase,
    pub barriers: BarrierPool,
}

impl State {
    pub fn new(cells: usize, wrappers: usize) -> Self {
        Self {
            ring: CircularBuffer::new(cells),
            next_seq: 0,
            queued: 0,
            busy: 0,
            idle: 0,
            active: vec![false; wrappers],
            pause: None,
            phase: Phase::Running,
            barriers: BarrierPool::new(),
        }
    }

    /// Bytes allocated to records.
    pub fn used_bytes(&self) -> usize {
        self.ring.used() * CELL_SIZE
    }

    /// Bytes not allocated to records.
    pub fn free_bytes(&self) -> usize {
        self.ring.free() * CELL_SIZE
    }

    /// Returns `true` if some admitted record has not been claimed.
    pub fn has_queued(&self) -> bool {
        self.queued > 0
    }

    /// Records admitted but not yet claimed.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Thread holding the queue paused, if any.
    pub fn paused_by(&self) -> Option<ThreadId> {
        self.pause.map(|(owner, _)| owner)
    }

    /// Returns `true` if a thread other than the caller holds the queue paused.
    pub fn held_elsewhere(&self) -> bool {
        matches!(self.pause, Some((owner, _)) if owner != thread::current().id())
    }

    /// Record one more pause guard held by `owner`.
    pub fn hold(&mut self, owner: ThreadId) {
        match &mut self.pause {
            Some((current, depth)) => {
                assert_eq!(*current, owner, "queue is paused by another thread");
                *depth += 1;
            }
            None => self.pause = Some((owner, 1)),
        }
    }

    /// Drop one pause guard, returning `true` once none are left.
    pub fn release(&mut self) -> bool {
        let Some((_, depth)) = &mut self.pause else {
            panic!("released a queue that is not paused");
        };
        *depth -= 1;
        if *depth > 0 {
            return false;
        }
        self.pause = None;
        true
    }

    /// Returns `true` if the ring is empty and no consumer is executing a payload.
    pub fn is_quiescent(&self) -> bool {
        self.ring.is_empty() && self.busy == 0
    }

    /// Returns `true` while new tasks may be submitted.
    pub fn accepting(&self) -> bool {
        matches!(self.phase, Phase::Running | Phase::Draining)
    }

    /// Returns `true` once consumers have been told to exit.
    pub fn exiting(&self) -> bool {
        matches!(self.phase, Phase::ShuttingDown | Phase::Exited)
    }

    /// Take the next sequence number (also used by tasks that bypass the ring).
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Place `pending` in the ring, returning its sequence number.
    ///
    /// Returns `pending` back if the ring has no contiguous span large enough.
    pub fn admit(&mut self, pending: Pending) -> Result<u64, Pending> {
        let cells = pending.cells;
        match self.ring.reserve(cells) {
            Some(span) if span.len() >= cells => {
                let seq = self.next_seq;
                span[0] = Some(Record::new(seq, pending));
            }
            _ => return Err(pending),
        }
        self.ring.commit(cells);
        self.next_seq += 1;
        self.queued += 1;
        Ok(self.next_seq - 1)
    }

    /// Claim the oldest unclaimed record.
    ///
    /// Nothing can be claimed while another thread holds the queue paused.
    pub fn claim(&mut self) -> Option<Claim> {
        if self.queued == 0 || self.held_elsewhere() {
            return None;
        }
        let (a, b) = self.ring.regions();
        for region in [a, b] {
            let mut index = region.start;
            while index < region.end {
                let record = self.record_mut(index);
                if record.claimed {
                    index += record.cells;
                    continue;
                }
                record.claimed = true;
                let seq = record.seq;
                let barrier = record.barrier.clone();
                let Some(task) = record.task.take() else {
                    panic!("unclaimed record {seq} has no payload");
                };
                self.queued -= 1;
                self.busy += 1;
                trace!(seq, index, "claimed record");
                return Some(Claim {
                    index,
                    seq,
                    task,
                    barrier,
                });
            }
        }
        panic!("{} queued records not found in the ring", self.queued);
    }

    /// Mark the record whose header is at `index` as finished and reclaim every finished record
    /// at the oldest end of the ring.
    ///
    /// Returns the number of cells freed.
    pub fn finish(&mut self, index: usize) -> usize {
        let record = self.record_mut(index);
        assert!(record.claimed, "finished an unclaimed record");
        assert!(!record.finished, "record finished twice");
        record.finished = true;
        let seq = record.seq;
        self.busy -= 1;
        trace!(seq, index, "finished record");
        self.reclaim()
    }

    fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        while let Some(head) = self.ring.read_slice_mut() {
            let (seq, cells) = match &head[0] {
                Some(record) if record.finished => (record.seq, record.cells),
                _ => break,
            };
            head[0] = None;
            self.ring.consume(cells);
            freed += cells;
            trace!(seq, cells, "reclaimed record");
        }
        freed
    }

    fn record_mut(&mut self, index: usize) -> &mut Record {
        let Some(record) = self.ring[index].as_mut() else {
            panic!("no record header at cell {index}");
        };
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Context, Task};

    struct Nop;

    impl Task for Nop {
        fn execute(&mut self, _ctx: &Context) {}
    }

    fn pending(cells: usize) -> Pending {
        Pending {
            task: Box::new(Nop),
            cells,
            barrier: None,
        }
    }

    #[test]
    fn test_claim_in_admission_order() {
        let mut state = State::new(16, 0);
        for expected in 0..4 {
            assert_eq!(state.admit(pending(2)).ok(), Some(expected));
        }
        assert_eq!(state.used_bytes(), 8 * CELL_SIZE);

        // Claims hand out records oldest first
        for expected in 0..4 {
            let claim = state.claim().unwrap();
            assert_eq!(claim.seq, expected);
            assert_eq!(claim.index, expected as usize * 2);
        }
        assert!(state.claim().is_none());
        assert_eq!(state.busy, 4);
    }

    #[test]
    fn test_reclaim_waits_for_oldest() {
        let mut state = State::new(16, 0);
        for _ in 0..3 {
            state.admit(pending(3)).ok().unwrap();
        }
        let a = state.claim().unwrap();
        let b = state.claim().unwrap();
        let c = state.claim().unwrap();

        // Later records finish first but cannot be reclaimed
        let free = state.free_bytes();
        assert_eq!(state.finish(c.index), 0);
        assert_eq!(state.finish(b.index), 0);
        assert_eq!(state.free_bytes(), free);

        // Finishing the oldest frees all three
        assert_eq!(state.finish(a.index), 9);
        assert_eq!(state.free_bytes(), free + 9 * CELL_SIZE);
        assert!(state.is_quiescent());
    }

    #[test]
    fn test_admit_rejects_short_span() {
        let mut state = State::new(8, 0);
        state.admit(pending(5)).ok().unwrap();
        let rejected = state.admit(pending(4)).err().unwrap();
        assert_eq!(rejected.cells, 4);

        // Nothing was published by the failed attempt
        assert_eq!(state.used_bytes(), 5 * CELL_SIZE);
        assert!(state.admit(pending(3)).is_ok());
    }

    #[test]
    fn test_claim_scans_wrapped_region() {
        let mut state = State::new(8, 0);
        state.admit(pending(3)).ok().unwrap();
        state.admit(pending(3)).ok().unwrap();

        // Free the first record so the next one wraps to the base of the ring
        let first = state.claim().unwrap();
        state.finish(first.index);
        state.admit(pending(3)).ok().unwrap();
        let (a, b) = state.ring.regions();
        assert_eq!(a, 3..6);
        assert_eq!(b, 0..3);

        // Region A is scanned before region B
        let second = state.claim().unwrap();
        assert_eq!((second.seq, second.index), (1, 3));
        let third = state.claim().unwrap();
        assert_eq!((third.seq, third.index), (2, 0));

        state.finish(second.index);
        state.finish(third.index);
        assert!(state.is_quiescent());
    }

    #[test]
    fn test_claim_blocked_by_other_pauser() {
        let mut state = State::new(8, 0);
        state.admit(pending(1)).ok().unwrap();

        // Held by a different thread: nothing is handed out
        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        state.hold(other);
        assert!(state.held_elsewhere());
        assert!(state.claim().is_none());
        assert!(state.release());

        // Held by this thread: claims proceed
        state.hold(thread::current().id());
        state.hold(thread::current().id());
        assert!(!state.held_elsewhere());
        assert_eq!(state.claim().map(|claim| claim.seq), Some(0));
        assert!(!state.release());
        assert!(state.release());
        assert_eq!(state.paused_by(), None);
    }

    #[test]
    #[should_panic(expected = "finished twice")]
    fn test_finish_twice() {
        let mut state = State::new(4, 0);
        state.admit(pending(1)).ok().unwrap();
        state.admit(pending(1)).ok().unwrap();
        state.claim().unwrap();
        let claim = state.claim().unwrap();

        // The second record stays in the ring behind the unfinished first one
        state.finish(claim.index);
        state.finish(claim.index);
    }
}
