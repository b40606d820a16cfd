//! Debug-build checks for the ring's commit paths.
//!
//! The ring tracks progress as a pair of element counts, the push count
//! running ahead of the pop count, with `push_next`/`pop_next` derived from
//! them. Every commit must keep that pair well formed: occupancy within
//! capacity, neither count moving backwards, and nothing retired that was
//! never committed. A violation is a caller bug in the inquire/commit
//! discipline; the checks cost nothing outside debug builds.

/// After a push commit, the occupancy must still fit the ring.
macro_rules! debug_assert_within_capacity {
    ($occupied:expr, $capacity:expr) => {
        debug_assert!(
            $occupied <= $capacity,
            "{} elements held in a ring of capacity {}",
            $occupied,
            $capacity
        )
    };
}

/// A commit may only move its side's cursor forward.
macro_rules! debug_assert_cursor_advances {
    ($side:literal, $before:expr, $after:expr) => {
        debug_assert!(
            $before <= $after,
            "{} cursor moved backwards ({} -> {})",
            $side,
            $before,
            $after
        )
    };
}

/// The pop side can only retire elements the push side has committed.
macro_rules! debug_assert_pop_within_pushed {
    ($popped:expr, $pushed:expr) => {
        debug_assert!(
            $popped <= $pushed,
            "{} elements retired with only {} committed",
            $popped,
            $pushed
        )
    };
}

pub(crate) use debug_assert_cursor_advances;
pub(crate) use debug_assert_pop_within_pushed;
pub(crate) use debug_assert_within_capacity;
