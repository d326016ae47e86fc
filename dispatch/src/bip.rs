//! A circular buffer that only ever hands out contiguous spans (a "Bip Buffer").
//!
//! [CircularBuffer] tracks up to two active regions over a fixed-capacity storage:
//!
//! ```text
//!   0        b_end        a_start              a_end          capacity
//!   +----------+------------+--------------------+----------------+
//!   | region B |    free    |      region A      |      free      |
//!   +----------+------------+--------------------+----------------+
//! ```
//!
//! Region A holds the oldest data (its start is the next element to read). Region B only exists
//! once A can no longer grow towards the end of the storage but there is room before A's start.
//! Reads always drain A first. When A is fully drained, B is promoted to become the new A (no
//! elements are moved). When both are drained, all pointers reset to the start of the storage.
//!
//! Because a write span never wraps around the end of the storage, callers can place a multi-element
//! record with a single copy. The cost is that the largest contiguous reservation may be smaller
//! than [CircularBuffer::free].
//!
//! # Invariants
//!
//! - `a_start <= a_end <= capacity` and `b_end <= a_start`.
//! - If A is empty then `a_start == a_end == 0` and B is empty.
//! - There are never more than two regions.
//!
//! # Example
//!
//! ```rust
//! use ringwork_dispatch::bip::CircularBuffer;
//!
//! let mut buffer = CircularBuffer::<u8>::new(8);
//!
//! // Write 3 bytes
//! let span = buffer.reserve(3).unwrap();
//! span.copy_from_slice(b"abc");
//! buffer.commit(3);
//!
//! // Read them back
//! assert_eq!(buffer.read_slice().unwrap(), b"abc");
//! buffer.consume(3);
//! assert!(buffer.is_empty());
//! ```

use std::{
    iter,
    marker::PhantomData,
    ops::{Index, IndexMut, Range},
};

/// A fixed-capacity ring that exposes contiguous read and write spans.
///
/// Storage may be owned (`Vec<T>`, the default) or borrowed (`&mut [T]`).
pub struct CircularBuffer<T, S = Vec<T>> {
    storage: S,

    /// First element of region A (the oldest unread element).
    a_start: usize,
    /// One past the newest element of region A.
    a_end: usize,
    /// One past the newest element of region B (which always starts at 0).
    ///
    /// B exists iff `b_end > 0`.
    b_end: usize,

    /// Span handed out by the last call to [CircularBuffer::reserve], if not yet committed.
    reserved: Option<Range<usize>>,

    _marker: PhantomData<T>,
}

impl<T: Default> CircularBuffer<T> {
    /// Create a buffer that owns `capacity` default-initialized elements.
    pub fn new(capacity: usize) -> Self {
        Self::from_storage(iter::repeat_with(T::default).take(capacity).collect())
    }

    /// Grow the owned storage to `capacity` elements.
    ///
    /// Both regions keep their offsets, so any data already written remains readable in order.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is smaller than the current capacity.
    pub fn resize(&mut self, capacity: usize) {
        assert!(
            capacity >= self.storage.len(),
            "circular buffer can only grow ({} -> {})",
            self.storage.len(),
            capacity
        );
        self.storage.resize_with(capacity, T::default);
        self.reserved = None;
    }
}

impl<T, S: AsRef<[T]> + AsMut<[T]>> CircularBuffer<T, S> {
    /// Create a buffer over existing storage. Existing contents are treated as free space.
    pub fn from_storage(storage: S) -> Self {
        Self {
            storage,
            a_start: 0,
            a_end: 0,
            b_end: 0,
            reserved: None,
            _marker: PhantomData,
        }
    }

    /// Total number of elements the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().len()
    }

    /// Number of elements written but not yet consumed (across both regions).
    pub fn used(&self) -> usize {
        (self.a_end - self.a_start) + self.b_end
    }

    /// Number of elements not currently in use (across both regions).
    ///
    /// The largest span [CircularBuffer::reserve] can return may be smaller than this.
    pub fn free(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Returns `true` if there is nothing to read.
    pub fn is_empty(&self) -> bool {
        self.a_start == self.a_end
    }

    /// Absolute index ranges of region A and region B (in read order).
    pub fn regions(&self) -> (Range<usize>, Range<usize>) {
        (self.a_start..self.a_end, 0..self.b_end)
    }

    /// The contiguous head of region A, or `None` if the buffer is empty.
    pub fn read_slice(&self) -> Option<&[T]> {
        if self.is_empty() {
            return None;
        }
        Some(&self.storage.as_ref()[self.a_start..self.a_end])
    }

    /// Mutable variant of [CircularBuffer::read_slice].
    pub fn read_slice_mut(&mut self) -> Option<&mut [T]> {
        if self.is_empty() {
            return None;
        }
        let (start, end) = (self.a_start, self.a_end);
        Some(&mut self.storage.as_mut()[start..end])
    }

    /// Release `n` elements from the head of region A.
    ///
    /// When A drains completely, B (if present) becomes the new A; otherwise every pointer
    /// resets to the start of the storage. Either way, an outstanding reservation is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the length of region A.
    pub fn consume(&mut self, n: usize) {
        let available = self.a_end - self.a_start;
        assert!(
            n <= available,
            "cannot consume {n} elements from a region of {available}"
        );
        self.a_start += n;
        if self.a_start < self.a_end {
            return;
        }

        // Promote B (if any) or reset to the base of the storage
        self.a_start = 0;
        self.a_end = self.b_end;
        self.b_end = 0;
        self.reserved = None;
    }

    /// Reserve a contiguous span for up to `len` elements.
    ///
    /// If region B exists, the span always extends B (bounded by A's start). Otherwise the span
    /// extends A when the space after A is sufficient (or at least as large as the space before
    /// A), and starts region B at the base of the storage when that offers more room.
    ///
    /// The returned span may be shorter than `len`: callers must check its length before
    /// writing. Returns `None` if no space is available. Nothing is published until
    /// [CircularBuffer::commit] is called.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero.
    pub fn reserve(&mut self, len: usize) -> Option<&mut [T]> {
        assert!(len > 0, "reservation must be non-empty");
        self.reserved = None;
        let range = if self.b_end > 0 {
            let free = self.a_start - self.b_end;
            if free == 0 {
                return None;
            }
            self.b_end..self.b_end + free.min(len)
        } else {
            let after = self.capacity() - self.a_end;
            let before = self.a_start;
            if after >= len || after >= before {
                if after == 0 {
                    return None;
                }
                self.a_end..self.a_end + after.min(len)
            } else {
                0..before.min(len)
            }
        };
        self.reserved = Some(range.clone());
        Some(&mut self.storage.as_mut()[range])
    }

    /// Publish the first `n` elements of the last reservation.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the reserved span (or there is no reservation and `n > 0`).
    pub fn commit(&mut self, n: usize) {
        let Some(range) = self.reserved.take() else {
            assert!(n == 0, "commit of {n} elements without a reservation");
            return;
        };
        assert!(
            n <= range.len(),
            "cannot commit {n} elements to a reservation of {}",
            range.len()
        );
        if n == 0 {
            return;
        }
        if self.b_end == 0 && range.start == self.a_end {
            self.a_end += n;
        } else {
            self.b_end = range.start + n;
        }
    }

    /// Forget all regions (elements are left in place).
    pub fn clear(&mut self) {
        self.a_start = 0;
        self.a_end = 0;
        self.b_end = 0;
        self.reserved = None;
    }
}

impl<T, S: AsRef<[T]>> Index<usize> for CircularBuffer<T, S> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.storage.as_ref()[index]
    }
}

impl<T, S: AsRef<[T]> + AsMut<[T]>> IndexMut<usize> for CircularBuffer<T, S> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.storage.as_mut()[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use ringwork_macros::test_traced;
    use std::collections::VecDeque;

    fn write(buffer: &mut CircularBuffer<u8>, data: &[u8]) {
        let span = buffer.reserve(data.len()).unwrap();
        assert!(span.len() >= data.len());
        span[..data.len()].copy_from_slice(data);
        buffer.commit(data.len());
    }

    #[test]
    fn test_empty() {
        let buffer = CircularBuffer::<u8>::new(16);
        assert!(buffer.is_empty());
        assert!(buffer.read_slice().is_none());
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.used(), 0);
        assert_eq!(buffer.free(), 16);
    }

    #[test]
    fn test_write_then_read() {
        let mut buffer = CircularBuffer::<u8>::new(16);
        write(&mut buffer, b"hello");
        assert_eq!(buffer.used(), 5);
        assert_eq!(buffer.free(), 11);
        assert_eq!(buffer.read_slice().unwrap(), b"hello");

        // Partial consume keeps the tail readable
        buffer.consume(2);
        assert_eq!(buffer.read_slice().unwrap(), b"llo");
        assert_eq!(buffer.used(), 3);

        // Full consume resets the pointers
        buffer.consume(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.regions(), (0..0, 0..0));
    }

    #[test]
    fn test_uncommitted_reservation_is_invisible() {
        let mut buffer = CircularBuffer::<u8>::new(8);
        buffer.reserve(4).unwrap().copy_from_slice(b"abcd");
        assert!(buffer.is_empty());
        assert_eq!(buffer.used(), 0);

        // A partial commit only publishes the prefix
        buffer.reserve(4).unwrap().copy_from_slice(b"wxyz");
        buffer.commit(2);
        assert_eq!(buffer.read_slice().unwrap(), b"wx");
    }

    #[test_traced]
    fn test_wraps_into_region_b() {
        let mut buffer = CircularBuffer::<u8>::new(8);
        write(&mut buffer, b"abcdef");
        buffer.consume(4);
        assert_eq!(buffer.regions(), (4..6, 0..0));

        // Only 2 slots after A but 4 before it: the write starts region B
        let span = buffer.reserve(4).unwrap();
        assert_eq!(span.len(), 4);
        span.copy_from_slice(b"ghij");
        buffer.commit(4);
        assert_eq!(buffer.regions(), (4..6, 0..4));
        assert_eq!(buffer.used(), 6);
        assert_eq!(buffer.free(), 2);

        // Reads drain A before B
        assert_eq!(buffer.read_slice().unwrap(), b"ef");
        buffer.consume(2);

        // B was promoted to A
        assert_eq!(buffer.regions(), (0..4, 0..0));
        assert_eq!(buffer.read_slice().unwrap(), b"ghij");
    }

    #[test]
    fn test_prefers_region_a_when_sufficient() {
        let mut buffer = CircularBuffer::<u8>::new(10);
        write(&mut buffer, b"abcd");
        buffer.consume(3);

        // 6 slots after A satisfy the request even though 3 exist before it
        let span = buffer.reserve(5).unwrap();
        assert_eq!(span.len(), 5);
        buffer.commit(5);
        assert_eq!(buffer.regions(), (3..9, 0..0));
    }

    #[test]
    fn test_short_span_returned_when_nothing_fits() {
        let mut buffer = CircularBuffer::<u8>::new(8);
        write(&mut buffer, b"abcde");
        buffer.consume(2);

        // 3 after, 2 before: the caller gets the larger (but insufficient) span
        let span = buffer.reserve(4).unwrap();
        assert_eq!(span.len(), 3);
        buffer.commit(0);
        assert_eq!(buffer.regions(), (2..5, 0..0));
    }

    #[test]
    fn test_region_b_bounded_by_head_of_a() {
        let mut buffer = CircularBuffer::<u8>::new(8);
        write(&mut buffer, b"abcdefg");
        buffer.consume(5);
        write(&mut buffer, b"hi");
        assert_eq!(buffer.regions(), (5..7, 0..2));

        // While B exists, writes extend B even though a slot remains after A
        let span = buffer.reserve(8).unwrap();
        assert_eq!(span.len(), 3);
        buffer.commit(3);
        assert_eq!(buffer.regions(), (5..7, 0..5));

        // B has caught up with A
        assert!(buffer.reserve(1).is_none());
        assert_eq!(buffer.free(), 1);
    }

    #[test]
    fn test_full() {
        let mut buffer = CircularBuffer::<u8>::new(4);
        write(&mut buffer, b"abcd");
        assert!(buffer.reserve(1).is_none());
        assert_eq!(buffer.free(), 0);
        buffer.consume(4);
        assert_eq!(buffer.reserve(4).unwrap().len(), 4);
    }

    #[test]
    fn test_consume_drops_reservation() {
        let mut buffer = CircularBuffer::<u8>::new(4);
        write(&mut buffer, b"ab");
        buffer.reserve(2).unwrap();
        buffer.consume(2);

        // The reservation pointed past the (now reset) region and is gone
        buffer.commit(0);
        assert!(buffer.is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot consume")]
    fn test_consume_too_much() {
        let mut buffer = CircularBuffer::<u8>::new(4);
        write(&mut buffer, b"ab");
        buffer.consume(3);
    }

    #[test]
    #[should_panic(expected = "without a reservation")]
    fn test_commit_without_reservation() {
        let mut buffer = CircularBuffer::<u8>::new(4);
        buffer.commit(1);
    }

    #[test]
    fn test_resize_keeps_regions() {
        let mut buffer = CircularBuffer::<u8>::new(4);
        write(&mut buffer, b"abc");
        buffer.consume(1);
        buffer.resize(8);
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.read_slice().unwrap(), b"bc");

        // The new space is usable immediately
        write(&mut buffer, b"defgh");
        assert_eq!(buffer.read_slice().unwrap(), b"bcdefgh");
    }

    #[test]
    #[should_panic(expected = "can only grow")]
    fn test_resize_shrink() {
        let mut buffer = CircularBuffer::<u8>::new(8);
        buffer.resize(4);
    }

    #[test]
    fn test_borrowed_storage() {
        let mut storage = [0u8; 6];
        {
            let mut buffer = CircularBuffer::<u8, _>::from_storage(&mut storage[..]);
            let span = buffer.reserve(3).unwrap();
            span.copy_from_slice(b"xyz");
            buffer.commit(3);
            buffer[0] = b'X';
            assert_eq!(buffer.read_slice().unwrap(), b"Xyz");
        }
        assert_eq!(&storage[..3], b"Xyz");
    }

    #[test_traced]
    fn test_random_interleaving_matches_model() {
        const CAPACITY: usize = 64;
        let mut rng = StdRng::seed_from_u64(0);
        let mut buffer = CircularBuffer::<u8>::new(CAPACITY);
        let mut model = VecDeque::new();
        let mut next = 0u8;

        for _ in 0..10_000 {
            if rng.gen_bool(0.5) {
                // Write a random amount (possibly less than requested)
                let len = rng.gen_range(1..=CAPACITY / 2);
                if let Some(span) = buffer.reserve(len) {
                    let n = span.len().min(len);
                    for slot in span[..n].iter_mut() {
                        *slot = next;
                        model.push_back(next);
                        next = next.wrapping_add(1);
                    }
                    buffer.commit(n);
                }
            } else if let Some(span) = buffer.read_slice() {
                // The read span always starts at the oldest unread element
                assert!(span.len() <= CAPACITY);
                let n = rng.gen_range(1..=span.len());
                for value in span[..n].iter() {
                    assert_eq!(Some(*value), model.pop_front());
                }
                buffer.consume(n);
            }
            assert_eq!(buffer.used(), model.len());
            assert_eq!(buffer.free(), CAPACITY - model.len());
        }

        // Draining exactly the used count leaves the buffer empty
        let mut drained = 0;
        let used = buffer.used();
        while let Some(span) = buffer.read_slice() {
            let n = span.len();
            drained += n;
            buffer.consume(n);
        }
        assert_eq!(drained, used);
        assert_eq!(buffer.used(), 0);
        assert!(buffer.is_empty());
    }
}
