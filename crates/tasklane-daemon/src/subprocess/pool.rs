//! Semaphore-based concurrency pool for agent processes.
//!
//! Every live agent holds one [`PoolPermit`]. The permit is returned to the
//! pool when the supervisor retires the process and drops it.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::info;

/// A permit granting the right to run one agent process.
#[derive(Debug)]
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

/// Fixed-size concurrency pool.
#[derive(Debug)]
pub struct ConcurrencyPool {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyPool {
    /// Create a pool. A limit of zero is raised to one.
    pub fn new(max_concurrent: usize) -> Self {
        let limit = max_concurrent.max(1);
        info!(max_concurrent = limit, "Concurrency pool created");
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrent: limit,
        }
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> Result<PoolPermit, PoolError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(PoolPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(PoolError::Exhausted {
                max: self.max_concurrent,
            }),
            Err(TryAcquireError::Closed) => Err(PoolError::Closed),
        }
    }

    /// Refuse all further permits. Outstanding permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of permits that can still be taken.
    pub fn available(&self) -> usize {
        if self.semaphore.is_closed() {
            0
        } else {
            self.semaphore.available_permits()
        }
    }
}

/// Errors from the concurrency pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("All {max} slots are in use")]
    Exhausted { max: usize },

    /// The pool was closed (supervisor shut down).
    #[error("Concurrency pool has been closed")]
    Closed,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_is_raised_to_one() {
        let pool = ConcurrencyPool::new(0);
        assert_eq!(pool.max_concurrent(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    #[allow(clippy::significant_drop_tightening)]
    fn try_acquire_stops_at_limit() {
        let pool = ConcurrencyPool::new(2);
        let first = pool.try_acquire().unwrap();
        let second = pool.try_acquire().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(matches!(
            pool.try_acquire(),
            Err(PoolError::Exhausted { max: 2 })
        ));
        drop((first, second));
    }

    #[test]
    fn permit_returned_on_drop() {
        let pool = ConcurrencyPool::new(1);
        {
            let _permit = pool.try_acquire().unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn closed_pool_refuses_permits() {
        let pool = ConcurrencyPool::new(3);
        let held = pool.try_acquire().unwrap();
        pool.close();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.try_acquire(), Err(PoolError::Closed)));
        drop(held);
    }
}
