//! Thread-safe counter for correlation ids and other monotonic identifiers.
//!
//! # What is a correlation id? (for beginners)
//!
//! Many calls to the control process can be in flight at once, and replies may
//! come back in any order.  Each request carries a unique integer `id`; the
//! reply echoes it, and the broker uses that id (and nothing else) to find the
//! caller waiting for it.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64`, so tasks on different runtime threads can
//! call [`SequenceCounter::next`] concurrently without a lock and without ever
//! receiving the same value twice.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing counter.
///
/// # Examples
///
/// ```rust
/// use relay_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::starting_at(1);
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter whose first [`next`](Self::next) returns `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            inner: AtomicU64::new(first),
        }
    }

    /// Returns the next value and atomically increments the counter.
    ///
    /// Wraps from `u64::MAX` to 0 without panicking.  `Relaxed` ordering is
    /// enough: the value is an identifier, not a synchronisation point.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to `next()` would produce.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
