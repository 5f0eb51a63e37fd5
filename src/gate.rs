//! Concurrency cap on outbound gateway calls.
//!
//! Callers arriving while the gate is full park in arrival order. `drain`
//! wakes every parked caller; a drained gate hands out no further permits,
//! so woken callers observe `None` and return without doing work.

use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Debug)]
pub struct BoundedGate {
    name: &'static str,
    capacity: usize,
    permits: Semaphore,
}

/// Held for the duration of one gateway call.
#[derive(Debug)]
pub struct GatePermit<'a> {
    _permit: SemaphorePermit<'a>,
}

impl BoundedGate {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            permits: Semaphore::new(capacity),
        }
    }

    /// Acquire a permit, parking while the gate is saturated. Returns
    /// `None` once the gate has been drained.
    pub async fn enter(&self) -> Option<GatePermit<'_>> {
        match self.permits.acquire().await {
            Ok(permit) => Some(GatePermit { _permit: permit }),
            Err(_) => None,
        }
    }

    /// Stop handing out permits and wake all parked callers.
    pub fn drain(&self) {
        self.permits.close();
    }

    pub fn is_drained(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
