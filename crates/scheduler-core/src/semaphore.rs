//! FIFO bounded concurrency gate.
//!
//! Wraps [`tokio::sync::Semaphore`], which grants acquired permits to
//! waiters in FIFO order, and adds a name so the engine can log which gate
//! a trigger is waiting on (global engine-wide, or a per-job-type override).

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, SemaphorePermit};

/// A named, bounded concurrency gate.
pub struct CapacityGate {
    name: String,
    inner: Arc<Semaphore>,
    capacity: usize,
}

impl CapacityGate {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    /// Wait in FIFO order for a permit. Resolves once capacity frees up.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.inner.acquire().await
    }

    /// Try to acquire without waiting; `None` if the gate is currently full.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.inner.try_acquire().ok()
    }

    /// Wait in FIFO order for a permit whose lifetime is independent of
    /// `&self` — for holding across a spawned task.
    pub async fn acquire_owned(self: &Arc<Self>) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.inner.clone().acquire_owned().await
    }
}

impl std::fmt::Debug for CapacityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityGate")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("available", &self.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_blocks_past_capacity() {
        let gate = Arc::new(CapacityGate::new("global", 1));
        let _permit = gate.acquire().await.unwrap();
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn releasing_a_permit_frees_capacity() {
        let gate = CapacityGate::new("global", 1);
        {
            let _permit = gate.acquire().await.unwrap();
            assert_eq!(gate.available_permits(), 0);
        }
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let gate = Arc::new(CapacityGate::new("global", 1));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));

        let first_permit = gate.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            let order = order.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                // Stagger task creation so arrival order is deterministic.
                while started.load(Ordering::SeqCst) < i {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                started.fetch_add(1, Ordering::SeqCst);
                let _permit = gate.acquire().await.unwrap();
                order.lock().await.push(i);
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first_permit);

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
