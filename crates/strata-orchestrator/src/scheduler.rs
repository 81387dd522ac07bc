//! Bounded per-level capacity scheduling
//!
//! One FIFO semaphore per hierarchy level. Level capacities are the single
//! mechanism preventing uncontrolled fan-out: no slice executes without
//! holding a permit from its level's pool, and waiters are served strictly
//! in arrival order.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{AgentHandle, Level, LevelCapacities, Result, StrataError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A granted batch of agent capacity at one level.
///
/// Capacity returns to the level's pool when the lease drops; there is no
/// explicit release call to forget.
#[derive(Debug)]
pub struct LevelLease {
    level: Level,
    handles: Vec<AgentHandle>,
    _permit: OwnedSemaphorePermit,
}

impl LevelLease {
    pub fn level(&self) -> Level {
        self.level
    }

    /// Handles granted by this lease, one per acquired slot
    pub fn handles(&self) -> &[AgentHandle] {
        &self.handles
    }
}

/// FIFO capacity scheduler over the three hierarchy levels.
pub struct LevelScheduler {
    capacities: LevelCapacities,
    primary: Arc<Semaphore>,
    secondary: Arc<Semaphore>,
    tertiary: Arc<Semaphore>,
}

impl LevelScheduler {
    pub fn new(capacities: LevelCapacities) -> Self {
        Self {
            primary: Arc::new(Semaphore::new(capacities.primary)),
            secondary: Arc::new(Semaphore::new(capacities.secondary)),
            tertiary: Arc::new(Semaphore::new(capacities.tertiary)),
            capacities,
        }
    }

    fn pool(&self, level: Level) -> &Arc<Semaphore> {
        match level {
            Level::Primary => &self.primary,
            Level::Secondary => &self.secondary,
            Level::Tertiary => &self.tertiary,
        }
    }

    /// Configured capacity bound for a level
    pub fn capacity(&self, level: Level) -> usize {
        self.capacities.capacity_of(level)
    }

    /// Slots currently free at a level
    pub fn available(&self, level: Level) -> usize {
        self.pool(level).available_permits()
    }

    /// Slots currently held by leases at a level
    pub fn in_use(&self, level: Level) -> usize {
        self.capacity(level) - self.available(level)
    }

    /// Acquire `n` agent slots at `level`, waiting FIFO behind earlier
    /// requests.
    ///
    /// Requests exceeding the level's total capacity fail immediately with
    /// [`StrataError::CapacityExceeded`]; so do requests that cannot be
    /// satisfied within `timeout`. Both are retryable. Cancellation via
    /// `token` aborts the wait without consuming capacity.
    pub async fn acquire(
        &self,
        level: Level,
        n: usize,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<LevelLease> {
        let capacity = self.capacity(level);
        if n == 0 {
            return Err(StrataError::Orchestrator(
                "cannot acquire zero agent slots".to_string(),
            ));
        }
        if n > capacity {
            return Err(StrataError::CapacityExceeded {
                level,
                requested: n,
                capacity,
            });
        }

        let pool = Arc::clone(self.pool(level));
        let permit = tokio::select! {
            acquired = tokio::time::timeout(timeout, pool.acquire_many_owned(n as u32)) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(StrataError::Orchestrator(
                            "level capacity pool closed".to_string(),
                        ))
                    }
                    Err(_) => {
                        return Err(StrataError::CapacityExceeded {
                            level,
                            requested: n,
                            capacity,
                        })
                    }
                }
            }
            _ = token.cancelled() => {
                return Err(StrataError::Cancelled("capacity acquisition".to_string()))
            }
        };

        debug!(%level, slots = n, in_use = self.in_use(level), "Acquired capacity");

        let handles = (0..n).map(|_| AgentHandle::new(level)).collect();
        Ok(LevelLease {
            level,
            handles,
            _permit: permit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(primary: usize, secondary: usize, tertiary: usize) -> LevelScheduler {
        LevelScheduler::new(LevelCapacities {
            primary,
            secondary,
            tertiary,
        })
    }

    #[tokio::test]
    async fn test_acquire_grants_handles_at_level() {
        let sched = scheduler(1, 10, 30);
        let token = CancellationToken::new();

        let lease = sched
            .acquire(Level::Secondary, 3, Duration::from_millis(100), &token)
            .await
            .unwrap();

        assert_eq!(lease.handles().len(), 3);
        assert!(lease.handles().iter().all(|h| h.level == Level::Secondary));
        assert_eq!(sched.in_use(Level::Secondary), 3);
    }

    #[tokio::test]
    async fn test_over_capacity_request_fails_immediately() {
        let sched = scheduler(1, 10, 30);
        let token = CancellationToken::new();

        let err = sched
            .acquire(Level::Tertiary, 40, Duration::from_secs(5), &token)
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(matches!(
            err,
            StrataError::CapacityExceeded {
                requested: 40,
                capacity: 30,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exhausted_level_times_out() {
        let sched = scheduler(1, 10, 30);
        let token = CancellationToken::new();

        let _held = sched
            .acquire(Level::Primary, 1, Duration::from_millis(50), &token)
            .await
            .unwrap();

        let err = sched
            .acquire(Level::Primary, 1, Duration::from_millis(50), &token)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_dropping_lease_releases_capacity() {
        let sched = scheduler(1, 2, 30);
        let token = CancellationToken::new();

        let lease = sched
            .acquire(Level::Secondary, 2, Duration::from_millis(50), &token)
            .await
            .unwrap();
        assert_eq!(sched.available(Level::Secondary), 0);

        drop(lease);
        assert_eq!(sched.available(Level::Secondary), 2);

        // The freed slots are immediately acquirable again
        sched
            .acquire(Level::Secondary, 2, Duration::from_millis(50), &token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait_without_consuming() {
        let sched = scheduler(1, 10, 30);
        let token = CancellationToken::new();

        let _held = sched
            .acquire(Level::Primary, 1, Duration::from_secs(5), &token)
            .await
            .unwrap();

        token.cancel();
        let err = sched
            .acquire(Level::Primary, 1, Duration::from_secs(5), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Cancelled(_)));
        assert_eq!(sched.in_use(Level::Primary), 1);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_arrival_order() {
        let sched = Arc::new(scheduler(1, 1, 30));
        let token = CancellationToken::new();

        let first = sched
            .acquire(Level::Secondary, 1, Duration::from_secs(1), &token)
            .await
            .unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..3 {
            let sched = Arc::clone(&sched);
            let token = token.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let lease = sched
                    .acquire(Level::Secondary, 1, Duration::from_secs(5), &token)
                    .await
                    .unwrap();
                order.lock().unwrap().push(i);
                drop(lease);
            }));
            // Give each waiter time to queue before the next arrives
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(first);
        for w in waiters {
            w.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_random_acquire_release_never_exceeds_capacity() {
        let sched = Arc::new(scheduler(1, 10, 5));
        let token = CancellationToken::new();
        let peak = Arc::new(std::sync::Mutex::new(0usize));

        let mut tasks = Vec::new();
        for seed in 0u64..24 {
            let sched = Arc::clone(&sched);
            let token = token.clone();
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                // Cheap per-task pseudo-random sequence, no shared state
                let mut state = seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                for _ in 0..8 {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    let n = (state >> 33) as usize % 3 + 1;
                    let hold_ms = (state >> 17) % 4;
                    let lease = sched
                        .acquire(Level::Tertiary, n, Duration::from_secs(10), &token)
                        .await
                        .unwrap();
                    let in_use = sched.in_use(Level::Tertiary);
                    assert!(in_use <= sched.capacity(Level::Tertiary));
                    {
                        let mut peak = peak.lock().unwrap();
                        if in_use > *peak {
                            *peak = in_use;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    drop(lease);
                }
            }));
        }

        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(sched.in_use(Level::Tertiary), 0);
        // FIFO stalls only once free slots drop below the head request size,
        // so the pool must have filled to at least capacity - 2
        assert!(*peak.lock().unwrap() >= 3);
    }
}
