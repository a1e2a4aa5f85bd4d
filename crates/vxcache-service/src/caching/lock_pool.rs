use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Number of reader/writer locks shared between all cache entries.
pub const DEFAULT_POOL_SIZE: usize = 256;

/// A fixed pool of reader/writer locks handed out round-robin.
///
/// The entry table can grow to thousands of entries; giving each one its
/// own lock would make lock count scale with cache size. Instead every new
/// entry borrows the next lock from this pool, so unrelated entries may
/// share an instance. That costs a little spurious contention and buys a
/// hard bound on live lock objects.
#[derive(Debug)]
pub struct LockPool {
    locks: Vec<Arc<RwLock<()>>>,
    next: Mutex<usize>,
}

impl LockPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        LockPool {
            locks: (0..size).map(|_| Arc::new(RwLock::new(()))).collect(),
            next: Mutex::new(0),
        }
    }

    /// Returns the next lock in round-robin order.
    pub fn next_lock(&self) -> Arc<RwLock<()>> {
        let mut next = self.next.lock();
        let lock = self.locks[*next].clone();
        *next = (*next + 1) % self.locks.len();
        lock
    }
}

impl Default for LockPool {
    fn default() -> Self {
        LockPool::new(DEFAULT_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_reuses_locks() {
        let pool = LockPool::new(2);
        let first = pool.next_lock();
        let second = pool.next_lock();
        let third = pool.next_lock();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let pool = LockPool::new(0);
        let first = pool.next_lock();
        let second = pool.next_lock();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
