//! Two-tier concurrency gate.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::trace;

use crate::{Error, Result};

/// Resource class of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Stages contending for a globally scarce resource. Capacity is always 1.
    Exclusive,
    /// Other externally bound stages. Capacity is configurable.
    Bounded,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Exclusive => write!(f, "exclusive"),
            PoolKind::Bounded => write!(f, "bounded"),
        }
    }
}

/// Exclusive and bounded semaphores shared by every stage of a run.
///
/// Permits are released when the wrapped task finishes, fails or is dropped.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    exclusive: Arc<Semaphore>,
    bounded: Arc<Semaphore>,
    bounded_capacity: usize,
}

impl ConcurrencyGate {
    /// Create the pools. A bounded capacity of 0 is raised to 1.
    pub fn new(bounded_capacity: usize) -> Self {
        let bounded_capacity = bounded_capacity.max(1);
        Self {
            exclusive: Arc::new(Semaphore::new(1)),
            bounded: Arc::new(Semaphore::new(bounded_capacity)),
            bounded_capacity,
        }
    }

    fn semaphore(&self, pool: PoolKind) -> &Arc<Semaphore> {
        match pool {
            PoolKind::Exclusive => &self.exclusive,
            PoolKind::Bounded => &self.bounded,
        }
    }

    pub fn capacity(&self, pool: PoolKind) -> usize {
        match pool {
            PoolKind::Exclusive => 1,
            PoolKind::Bounded => self.bounded_capacity,
        }
    }

    pub fn available(&self, pool: PoolKind) -> usize {
        self.semaphore(pool).available_permits()
    }

    /// Run `task` while holding a permit from `pool`.
    pub async fn with_permit<F, T>(&self, pool: PoolKind, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore(pool)
            .acquire()
            .await
            .map_err(|_| Error::Other(format!("{pool} pool is closed")))?;
        trace!(%pool, available = self.available(pool), "Permit acquired");
        task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn track(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Result<()> {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    #[tokio::test]
    async fn test_exclusive_pool_runs_one_at_a_time() {
        let gate = ConcurrencyGate::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6).map(|_| {
            gate.with_permit(PoolKind::Exclusive, track(active.clone(), peak.clone()))
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exclusive_pool_is_fifo() {
        let gate = ConcurrencyGate::new(3);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let tasks = (0..6).map(|i| {
            let order = order.clone();
            gate.with_permit(PoolKind::Exclusive, async move {
                order.lock().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert_eq!(*order.lock(), (0..6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_bounded_pool_caps_concurrency() {
        let gate = ConcurrencyGate::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            gate.with_permit(PoolKind::Bounded, track(active.clone(), peak.clone()))
        });
        futures::future::join_all(tasks).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(gate.available(PoolKind::Bounded), 2);
    }

    #[tokio::test]
    async fn test_permit_released_on_error() {
        let gate = ConcurrencyGate::new(1);
        let result: Result<()> = gate
            .with_permit(PoolKind::Exclusive, async { Err(Error::Other("boom".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(gate.available(PoolKind::Exclusive), 1);
    }

    #[tokio::test]
    async fn test_permit_released_on_cancel() {
        let gate = ConcurrencyGate::new(1);
        let pending = gate.with_permit(PoolKind::Exclusive, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(gate.available(PoolKind::Exclusive), 1);
    }

    #[test]
    fn test_zero_capacity_raised() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.capacity(PoolKind::Bounded), 1);
        assert_eq!(gate.capacity(PoolKind::Exclusive), 1);
    }
}
