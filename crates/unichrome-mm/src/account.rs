//! Global memory-accounting quota.
//!
//! Checked before any backing store is allocated, so quota rejection is
//! distinguishable (internally) from a domain allocator running out of
//! space. Both surface to callers as [`Error::OutOfMemory`].

use std::sync::Mutex;

use unichrome_types::Error;

#[derive(Debug)]
struct PoolState {
    capacity: u64,
    used: u64,
}

#[derive(Debug)]
pub struct AccountingPool {
    state: Mutex<PoolState>,
}

impl AccountingPool {
    pub fn new(capacity: u64) -> AccountingPool {
        AccountingPool {
            state: Mutex::new(PoolState { capacity, used: 0 }),
        }
    }

    pub fn reserve(&self, bytes: u64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let used = state
            .used
            .checked_add(bytes)
            .filter(|used| *used <= state.capacity)
            .ok_or(Error::OutOfMemory { requested: bytes })?;
        state.used = used;
        Ok(())
    }

    pub fn release(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.used >= bytes);
        state.used = state.used.saturating_sub(bytes);
    }

    pub fn used(&self) -> u64 {
        self.state.lock().unwrap().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_is_enforced_and_released() {
        let pool = AccountingPool::new(100);
        pool.reserve(60).unwrap();
        pool.reserve(40).unwrap();
        assert_eq!(
            pool.reserve(1),
            Err(Error::OutOfMemory { requested: 1 })
        );
        pool.release(40);
        pool.reserve(30).unwrap();
        assert_eq!(pool.used(), 90);
    }
}
