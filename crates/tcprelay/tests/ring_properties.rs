//! Property-based tests for the segmented ring buffer, plus the threaded
//! soak test that exercises the SPSC protocol across two real threads.

use proptest::prelude::*;
use std::collections::VecDeque;
use tcprelay::Ring;

// =============================================================================
// Free space accounting
// "push_inquire total + size == capacity", and when two segments come back
// the first ends at the storage end and the second starts at the storage
// beginning.
// =============================================================================

proptest! {
    #[test]
    fn prop_push_inquire_complements_size(
        capacity in 1usize..64,
        ops in prop::collection::vec((any::<bool>(), 1usize..16), 1..200),
    ) {
        let ring = Ring::<u8>::new(capacity);

        // On a fresh ring the first writable region is the whole storage,
        // which pins down the array bounds for the segment-shape checks.
        let (storage_begin, storage_end) = {
            let (first, _) = ring.push_inquire();
            prop_assert_eq!(first.len(), capacity);
            let begin = first.as_ptr();
            (begin, unsafe { begin.add(capacity) })
        };

        for (is_push, amount) in ops {
            let (first, second) = ring.push_inquire();
            prop_assert_eq!(first.len() + second.len() + ring.size(), capacity);
            if !first.is_empty() && !second.is_empty() {
                prop_assert_eq!(unsafe { first.as_ptr().add(first.len()) }, storage_end);
                prop_assert_eq!(second.as_ptr(), storage_begin);
            }

            if is_push {
                let n = amount.min(first.len() + second.len());
                ring.push(n);
            } else {
                let n = amount.min(ring.size());
                ring.pop(n);
            }
        }
    }
}

// =============================================================================
// Occupancy accounting
// "pop_inquire total == size" for every reachable state.
// =============================================================================

proptest! {
    #[test]
    fn prop_pop_inquire_matches_size(
        capacity in 1usize..64,
        ops in prop::collection::vec((any::<bool>(), 1usize..16), 1..200),
    ) {
        let ring = Ring::<u8>::new(capacity);

        for (is_push, amount) in ops {
            let (first, second) = ring.pop_inquire();
            prop_assert_eq!(first.len() + second.len(), ring.size());

            if is_push {
                let (a, b) = ring.push_inquire();
                let n = amount.min(a.len() + b.len());
                ring.push(n);
            } else {
                let n = amount.min(ring.size());
                ring.pop(n);
            }
        }
    }
}

// =============================================================================
// FIFO round trip
// Bytes written into the advertised regions come back identical and in
// order through pop_inquire, across arbitrary interleavings and wraps.
// =============================================================================

proptest! {
    #[test]
    fn prop_fifo_round_trip(
        capacity in 1usize..48,
        ops in prop::collection::vec((any::<bool>(), 1usize..16), 1..300),
    ) {
        let ring = Ring::<u8>::new(capacity);
        let mut model: VecDeque<u8> = VecDeque::new();
        let mut next = 0u8;

        for (is_push, amount) in ops {
            if is_push {
                let (first, second) = ring.push_inquire();
                let take = amount.min(first.len() + second.len());
                let in_first = take.min(first.len());
                for slot in &mut first[..in_first] {
                    *slot = next;
                    model.push_back(next);
                    next = next.wrapping_add(1);
                }
                for slot in &mut second[..take - in_first] {
                    *slot = next;
                    model.push_back(next);
                    next = next.wrapping_add(1);
                }
                ring.push(take);
            } else {
                let (first, second) = ring.pop_inquire();
                let take = amount.min(first.len() + second.len());
                let in_first = take.min(first.len());
                for &byte in &first[..in_first] {
                    prop_assert_eq!(Some(byte), model.pop_front());
                }
                for &byte in &second[..take - in_first] {
                    prop_assert_eq!(Some(byte), model.pop_front());
                }
                ring.pop(take);
            }
            prop_assert_eq!(ring.size(), model.len());
        }
    }
}

// =============================================================================
// Threaded soak
// One producer and one consumer thread share a capacity-37 ring, moving a
// monotone u32 sequence in random-length chunks. The pop-side validation
// hook checks every retired element; at the end the last value read equals
// the last value written.
// =============================================================================

mod soak {
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use tcprelay::Ring;

    static NEXT_EXPECTED: AtomicU32 = AtomicU32::new(1);

    fn expect_monotone(region: &[u32]) {
        for &value in region {
            let expected = NEXT_EXPECTED.fetch_add(1, Ordering::Relaxed);
            assert_eq!(value, expected, "ring delivered out-of-sequence value");
        }
    }

    #[test]
    fn producer_consumer_soak_capacity_37() {
        let ring = Arc::new(Ring::<u32>::with_validator(37, expect_monotone));
        let producer_done = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + Duration::from_millis(1500);

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut value: u32 = 0;
                while Instant::now() < deadline {
                    let (first, second) = ring.push_inquire();
                    let free = first.len() + second.len();
                    if free == 0 {
                        thread::yield_now();
                        continue;
                    }
                    let take = rng.gen_range(1..=free);
                    let in_first = take.min(first.len());
                    for slot in &mut first[..in_first] {
                        value += 1;
                        *slot = value;
                    }
                    for slot in &mut second[..take - in_first] {
                        value += 1;
                        *slot = value;
                    }
                    ring.push(take);
                    thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                }
                value
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            let producer_done = Arc::clone(&producer_done);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                loop {
                    let (first, second) = ring.pop_inquire();
                    let avail = first.len() + second.len();
                    if avail == 0 {
                        if producer_done.load(Ordering::Acquire) && ring.is_empty() {
                            break;
                        }
                        thread::yield_now();
                        continue;
                    }
                    let take = rng.gen_range(1..=avail);
                    // The validator checks every retired element.
                    ring.pop(take);
                    thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                }
            })
        };

        let last_written = producer.join().expect("producer panicked");
        producer_done.store(true, Ordering::Release);
        consumer.join().expect("consumer panicked");

        let last_read = NEXT_EXPECTED.load(Ordering::Relaxed) - 1;
        assert_eq!(last_read, last_written);
        assert!(ring.is_empty());
    }
}
