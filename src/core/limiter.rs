// src/core/limiter.rs

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

/// Counting admission gate bounding how many probes run at once.
///
/// `acquire` hands out an RAII [`LimiterPermit`]; the slot is released exactly
/// once when the permit is dropped, whichever way the probe ends.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    slots: Arc<Semaphore>,
    occupied: Arc<watch::Sender<usize>>,
    capacity: usize,
}

/// An occupied limiter slot.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    occupied: Arc<watch::Sender<usize>>,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (occupied, _) = watch::channel(0usize);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            occupied: Arc::new(occupied),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn occupied(&self) -> usize {
        *self.occupied.borrow()
    }

    /// Waits for a free slot and occupies it.
    pub async fn acquire(&self) -> LimiterPermit {
        // The semaphore is never closed, so acquisition only fails if that invariant breaks.
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("limiter semaphore closed"),
        };
        self.occupied.send_modify(|n| *n += 1);
        LimiterPermit {
            _permit: permit,
            occupied: self.occupied.clone(),
        }
    }

    /// Blocks until no slot is occupied.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.occupied.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.occupied.send_modify(|n| *n = n.saturating_sub(1));
    }
}
