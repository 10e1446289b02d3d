//! Concurrency gate bounding simultaneous pipeline runs.

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Fixed-capacity admission gate.
///
/// Each running pipeline holds one [`GateToken`]; dropping the token
/// returns it, whether the pipeline succeeded, failed, or panicked.
/// Waiters are admitted in arrival order.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Proof of admission through a [`ConcurrencyGate`].
#[derive(Debug)]
pub struct GateToken {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// Creates a gate admitting at most `capacity` holders at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free token.
    ///
    /// Fails only after [`close`](Self::close).
    pub async fn acquire(&self) -> Result<GateToken, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        Ok(GateToken { _permit: permit })
    }

    /// Stops admitting; pending and future `acquire` calls fail.
    #[cfg(test)]
    fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens currently held.
    #[cfg(test)]
    fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tokens_are_bounded_and_returned() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.acquire().await.unwrap();
        let _b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_use(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(blocked.is_err());

        drop(a);
        assert_eq!(gate.in_use(), 1);
        let _c = tokio::time::timeout(Duration::from_millis(50), gate.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gate.in_use(), 2);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.is_err() })
        };
        tokio::task::yield_now().await;
        gate.close();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_fifo_admission() {
        let gate = ConcurrencyGate::new(1);
        let held = gate.acquire().await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..3 {
            let gate = gate.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _token = gate.acquire().await.unwrap();
                tx.send(i).unwrap();
            });
            // Let each waiter queue up before the next one.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(held);

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
    }
}
