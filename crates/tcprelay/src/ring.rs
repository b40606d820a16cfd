use crate::invariants::{
    debug_assert_cursor_advances, debug_assert_pop_within_pushed, debug_assert_within_capacity,
};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// SYNCHRONIZATION STRATEGY
// =============================================================================
//
// This is an SPSC ring buffer with a two-phase inquire/commit protocol on
// both sides. Positions are unbounded u64 sequence counters; the buffer
// index is computed as `sequence % capacity` only when touching storage.
// Because the counters never wrap in practice, `tail == head` means empty
// and `tail - head == capacity` means full, so the entire capacity is
// usable with no reserved slot and no separate empty flag.
//
// **Producer (push side):**
// 1. Load `tail` with Relaxed (only the producer writes tail)
// 2. Load `head` with Acquire (synchronizes with the consumer's Release)
// 3. Write elements into the regions returned by `push_inquire`
// 4. `push(n)` stores `tail + n` with Release (publishes the writes)
//
// **Consumer (pop side):**
// 1. Load `head` with Relaxed (only the consumer writes head)
// 2. Load `tail` with Acquire (synchronizes with the producer's Release)
// 3. Read elements from the regions returned by `pop_inquire`
// 4. `pop(n)` stores `head + n` with Release (publishes consumption)
//
// Storage slots between head and tail are only read by the consumer; slots
// between tail and head+capacity are only written by the producer. The
// Acquire/Release pairing on the opposing counter keeps those sets disjoint.
// Callers must uphold the SPSC discipline: at most one thread pushing and
// one thread popping. Within one copy engine both sides run on the same
// thread, which satisfies the discipline trivially.
//
// =============================================================================

/// Segmented SPSC ring buffer over a fixed-capacity contiguous array.
///
/// Both sides interact through an inquire/commit protocol: `push_inquire`
/// (`pop_inquire`) exposes up to two contiguous regions covering all free
/// (occupied) space, and `push(n)` (`pop(n)`) commits how many elements were
/// actually transferred. Two segments let the caller hand both directly to
/// vectored I/O, so a wrapped buffer still costs one system call per side.
///
/// Capacity may be any nonzero size; it is not rounded to a power of two.
pub struct Ring<T> {
    /// Total elements pushed (written by producer, read by consumer).
    tail: CachePadded<AtomicU64>,
    /// Total elements popped (written by consumer, read by producer).
    head: CachePadded<AtomicU64>,
    /// Committed push operations.
    push_ops: AtomicU64,
    /// Committed pop operations.
    pop_ops: AtomicU64,
    capacity: usize,
    /// Test hook: invoked on each region retired by `pop`.
    validator: Option<fn(&[T])>,
    buffer: UnsafeCell<Box<[T]>>,
}

// SAFETY: sends/shares only require T: Send; all cross-thread access to the
// storage is mediated by the Acquire/Release protocol described above.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T: Copy + Default> Ring<T> {
    /// Creates a ring with `capacity` elements of storage.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Creates a ring whose `pop` commits run `validator` over each retired
    /// region. Intended for tests that want element-level checking without
    /// coupling the buffer to element semantics.
    pub fn with_validator(capacity: usize, validator: fn(&[T])) -> Self {
        Self::build(capacity, Some(validator))
    }

    fn build(capacity: usize, validator: Option<fn(&[T])>) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        let buffer = vec![T::default(); capacity].into_boxed_slice();
        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            push_ops: AtomicU64::new(0),
            pop_ops: AtomicU64::new(0),
            capacity,
            validator,
            buffer: UnsafeCell::new(buffer),
        }
    }
}

impl<T> Ring<T> {
    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    /// Returns the ring capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the current occupancy.
    #[inline]
    pub fn size(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head) as usize
    }

    /// Returns true if the ring holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true if the ring is at capacity.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.size() == self.capacity
    }

    /// Returns the committed (push, pop) operation counts.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.push_ops.load(Ordering::Relaxed),
            self.pop_ops.load(Ordering::Relaxed),
        )
    }

    #[inline]
    fn index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    /// SAFETY: caller must guarantee `[start, start + len)` is in bounds and
    /// that the region is on the producer's side of the protocol (free space).
    #[allow(clippy::mut_from_ref)]
    unsafe fn region_mut(&self, start: usize, len: usize) -> &mut [T] {
        let buf = self.buffer.get();
        slice::from_raw_parts_mut((*buf).as_mut_ptr().add(start), len)
    }

    /// SAFETY: caller must guarantee `[start, start + len)` is in bounds and
    /// that the region is on the consumer's side of the protocol (occupied).
    unsafe fn region(&self, start: usize, len: usize) -> &[T] {
        let buf = self.buffer.get();
        slice::from_raw_parts((*buf).as_ptr().add(start), len)
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Returns up to two disjoint writable regions (second may be empty)
    /// whose total length equals the free space at this instant.
    ///
    /// When wrap is in effect (`push_next < pop_next`) a single region is
    /// returned. Otherwise the first region runs to the end of storage and
    /// the second from the start of storage to `pop_next`; on an empty
    /// buffer the second region covers the full prefix before `pop_next`.
    #[allow(clippy::mut_from_ref)]
    pub fn push_inquire(&self) -> (&mut [T], &mut [T]) {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let used = tail.wrapping_sub(head) as usize;
        let free = self.capacity - used;

        // SAFETY: the returned regions lie entirely in free space: slots in
        // [tail, head + capacity) are never read by the consumer, and the
        // Acquire load of head above synchronizes with the consumer's
        // Release store that freed them.
        unsafe {
            if free == 0 {
                return (self.region_mut(0, 0), self.region_mut(0, 0));
            }
            let push_next = self.index(tail);
            let pop_next = self.index(head);
            if push_next < pop_next {
                // Wrap in effect: one contiguous run up to the consumer.
                (self.region_mut(push_next, pop_next - push_next), self.region_mut(0, 0))
            } else {
                (
                    self.region_mut(push_next, self.capacity - push_next),
                    self.region_mut(0, pop_next),
                )
            }
        }
    }

    /// Commits `n` elements just written into the regions returned by the
    /// most recent `push_inquire`.
    ///
    /// # Panics
    ///
    /// Panics with a ring overflow message if `n` exceeds the advertised
    /// free space. That is a caller bug, not a recoverable condition.
    pub fn push(&self, n: usize) {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let free = self.capacity - tail.wrapping_sub(head) as usize;
        assert!(n <= free, "ring overflow: push({n}) with {free} free");
        if n == 0 {
            return;
        }

        let new_tail = tail.wrapping_add(n as u64);
        debug_assert_cursor_advances!("push", tail, new_tail);
        debug_assert_within_capacity!(new_tail.wrapping_sub(head) as usize, self.capacity);

        self.tail.store(new_tail, Ordering::Release);
        self.push_ops.fetch_add(1, Ordering::Relaxed);
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Returns up to two disjoint readable regions (second may be empty)
    /// whose total length equals the occupancy at this instant.
    pub fn pop_inquire(&self) -> (&[T], &[T]) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let used = tail.wrapping_sub(head) as usize;

        // SAFETY: the returned regions lie entirely in occupied space:
        // slots in [head, tail) were written by the producer and published
        // by its Release store of tail, which the Acquire load above
        // synchronizes with. The producer will not overwrite them until
        // head advances past them.
        unsafe {
            if used == 0 {
                return (self.region(0, 0), self.region(0, 0));
            }
            let pop_next = self.index(head);
            let push_next = self.index(tail);
            if pop_next < push_next {
                (self.region(pop_next, push_next - pop_next), self.region(0, 0))
            } else {
                (
                    self.region(pop_next, self.capacity - pop_next),
                    self.region(0, push_next),
                )
            }
        }
    }

    /// Commits `n` elements consumed from the regions returned by the most
    /// recent `pop_inquire`, running the validator (if any) over the retired
    /// region(s).
    ///
    /// # Panics
    ///
    /// Panics with a ring underflow message if `n` exceeds the occupancy.
    pub fn pop(&self, n: usize) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let used = tail.wrapping_sub(head) as usize;
        assert!(n <= used, "ring underflow: pop({n}) with {used} occupied");
        if n == 0 {
            return;
        }

        if let Some(validate) = self.validator {
            let pop_next = self.index(head);
            let first = n.min(self.capacity - pop_next);
            // SAFETY: both regions are within the occupied range checked above.
            unsafe {
                validate(self.region(pop_next, first));
                if first < n {
                    validate(self.region(0, n - first));
                }
            }
        }

        let new_head = head.wrapping_add(n as u64);
        debug_assert_cursor_advances!("pop", head, new_head);
        debug_assert_pop_within_pushed!(new_head, tail);

        self.head.store(new_head, Ordering::Release);
        self.pop_ops.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(seg: &mut [u8], src: &mut impl Iterator<Item = u8>) -> usize {
        let mut n = 0;
        for slot in seg {
            match src.next() {
                Some(v) => {
                    *slot = v;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    #[test]
    fn basic_push_pop() {
        let ring = Ring::<u8>::new(8);
        assert!(ring.is_empty());

        let (a, _b) = ring.push_inquire();
        a[..5].copy_from_slice(b"abcde");
        ring.push(5);
        assert_eq!(ring.size(), 5);

        let (a, b) = ring.pop_inquire();
        assert_eq!(a.len() + b.len(), 5);
        assert_eq!(a, b"abcde");
        ring.pop(5);
        assert!(ring.is_empty());
        assert_eq!(ring.counters(), (1, 1));
    }

    #[test]
    fn inquire_totals_are_complementary() {
        let ring = Ring::<u8>::new(7);
        let mut src = 0u8..;

        // Walk through enough commits to wrap several times.
        for step in 0..40 {
            let (a, b) = ring.push_inquire();
            let free = a.len() + b.len();
            assert_eq!(free + ring.size(), ring.capacity());

            let take = (step % 3) + 1;
            let take = take.min(free);
            let first = take.min(a.len());
            let wrote = fill(&mut a[..first], &mut src) + fill(&mut b[..take - first], &mut src);
            ring.push(wrote);

            let (c, d) = ring.pop_inquire();
            assert_eq!(c.len() + d.len(), ring.size());
            let retire = ((step % 2) + 1).min(c.len() + d.len());
            ring.pop(retire);
        }
    }

    #[test]
    fn two_segment_push_shapes() {
        let ring = Ring::<u8>::new(6);

        // Empty ring at offset 0: one run to the end, empty prefix.
        let (a, b) = ring.push_inquire();
        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 0);
        ring.push(4);
        ring.pop(3);

        // push_next=4, pop_next=3: run to storage end plus prefix before
        // the consumer.
        let (a, b) = ring.push_inquire();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 3);

        // Fill completely: zero space advertised.
        ring.push(5);
        assert!(ring.is_full());
        let (a, b) = ring.push_inquire();
        assert_eq!(a.len() + b.len(), 0);
    }

    #[test]
    fn wrapped_pop_returns_two_segments() {
        let ring = Ring::<u8>::new(5);
        let (a, _) = ring.push_inquire();
        a.copy_from_slice(b"01234");
        ring.push(5);
        ring.pop(3);

        let (a, _) = ring.push_inquire();
        a[..2].copy_from_slice(b"56");
        ring.push(2);

        // Occupied region wraps: tail of storage then head of storage.
        let (c, d) = ring.pop_inquire();
        assert_eq!(c, b"34");
        assert_eq!(d, b"56");
    }

    #[test]
    fn data_comes_back_in_order() {
        let ring = Ring::<u8>::new(4);
        let mut out = Vec::new();
        let mut next = 0u8;

        while out.len() < 64 {
            let (a, b) = ring.push_inquire();
            let mut src = next..;
            let wrote = fill(a, &mut src) + fill(b, &mut src);
            next = next.wrapping_add(wrote as u8);
            ring.push(wrote);

            let (c, d) = ring.pop_inquire();
            out.extend_from_slice(c);
            out.extend_from_slice(d);
            ring.pop(c.len() + d.len());
        }

        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as u8);
        }
    }

    #[test]
    #[should_panic(expected = "ring overflow")]
    fn over_commit_push_panics() {
        let ring = Ring::<u8>::new(4);
        ring.push(5);
    }

    #[test]
    #[should_panic(expected = "ring underflow")]
    fn over_commit_pop_panics() {
        let ring = Ring::<u8>::new(4);
        ring.push(2);
        ring.pop(3);
    }

    #[test]
    fn validator_sees_retired_regions() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SEEN: AtomicUsize = AtomicUsize::new(0);

        fn count(region: &[u8]) {
            SEEN.fetch_add(region.len(), Ordering::SeqCst);
        }

        SEEN.store(0, Ordering::SeqCst);
        let ring = Ring::<u8>::with_validator(5, count);
        ring.push(4);
        ring.pop(2);
        ring.push(3); // wraps
        ring.pop(5); // retires two regions
        assert_eq!(SEEN.load(Ordering::SeqCst), 7);
    }
}
