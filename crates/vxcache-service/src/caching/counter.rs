use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering::SeqCst};

/// A thread-safe tally.
///
/// Used for the global byte budget and for handing out path sequence
/// numbers. The adjust-and-test operations report how the updated value
/// compares to a limit in the same atomic step, so the caller can decide to
/// trigger eviction without racing a separate read against concurrent
/// updates.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_value(value: i64) -> Self {
        Counter(AtomicI64::new(value))
    }

    /// Adds `n` and reports how the new total compares to `limit`.
    pub fn increment_test(&self, n: u64, limit: u64) -> Ordering {
        let new = self.0.fetch_add(n as i64, SeqCst) + n as i64;
        new.cmp(&(limit as i64))
    }

    /// Subtracts `n` and reports how the new total compares to `limit`.
    pub fn decrement_test(&self, n: u64, limit: u64) -> Ordering {
        self.saturating_sub(n).cmp(&(limit as i64))
    }

    /// Subtracts `n`, saturating at zero.
    ///
    /// The byte tally is approximate across races; a stray decrement must
    /// not wedge it below zero.
    pub fn decrement(&self, n: u64) {
        self.saturating_sub(n);
    }

    /// The current value.
    pub fn get(&self) -> u64 {
        self.0.load(SeqCst).max(0) as u64
    }

    pub fn reset(&self) {
        self.0.store(0, SeqCst);
    }

    /// Returns the next sequence number.
    ///
    /// Sequences start at 1 and wrap back to 1 once the integer maximum is
    /// reached.
    pub fn next_sequence(&self) -> u64 {
        let previous = self
            .0
            .fetch_update(SeqCst, SeqCst, |value| {
                Some(if value == i64::MAX { 1 } else { value + 1 })
            })
            .expect("sequence update always produces a value");
        if previous == i64::MAX {
            1
        } else {
            (previous + 1) as u64
        }
    }

    fn saturating_sub(&self, n: u64) -> i64 {
        let mut current = self.0.load(SeqCst);
        loop {
            let new = (current - n as i64).max(0);
            match self.0.compare_exchange_weak(current, new, SeqCst, SeqCst) {
                Ok(_) => return new,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_test() {
        let counter = Counter::new();
        assert_eq!(counter.increment_test(10, 100), Ordering::Less);
        assert_eq!(counter.increment_test(90, 100), Ordering::Equal);
        assert_eq!(counter.increment_test(1, 100), Ordering::Greater);
        assert_eq!(counter.get(), 101);
    }

    #[test]
    fn test_decrement_saturates_at_zero() {
        let counter = Counter::new();
        counter.increment_test(5, u64::MAX);
        counter.decrement(100);
        assert_eq!(counter.get(), 0);

        assert_eq!(counter.decrement_test(1, 10), Ordering::Less);
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let counter = Counter::new();
        assert_eq!(counter.next_sequence(), 1);
        assert_eq!(counter.next_sequence(), 2);
        assert_eq!(counter.next_sequence(), 3);
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let counter = Counter::with_value(i64::MAX - 1);
        assert_eq!(counter.next_sequence(), i64::MAX as u64);
        assert_eq!(counter.next_sequence(), 1);
        assert_eq!(counter.next_sequence(), 2);
    }

    #[test]
    fn test_reset() {
        let counter = Counter::new();
        counter.increment_test(42, u64::MAX);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }
}
