//! Concurrency gates
//!
//! Two process-wide counting semaphores bound query-path parallelism: the
//! reads gate caps concurrent storage fetches globally, the timeseries gate
//! caps concurrent per-query timeseries work. Acquisition order is fixed,
//! coarse before fine, so two executors can never hold one gate each while
//! waiting on the other.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// The process-wide gate pair
#[derive(Clone)]
pub struct ConcurrencyGates {
    reads: Arc<Semaphore>,
    timeseries: Arc<Semaphore>,
}

/// Held slots on both gates; dropping releases the timeseries slot first,
/// then the reads slot
pub struct GateSlot {
    _timeseries: OwnedSemaphorePermit,
    _reads: OwnedSemaphorePermit,
}

impl ConcurrencyGates {
    /// Create the gate pair. The timeseries gate must not be wider than the
    /// reads gate, otherwise the fixed acquisition order loses its point.
    pub fn new(max_concurrent_reads: usize, max_concurrent_timeseries: usize) -> Result<Self> {
        if max_concurrent_reads == 0 {
            return Err(Error::init("max_concurrent_reads must be bigger than zero"));
        }
        if max_concurrent_timeseries > max_concurrent_reads {
            return Err(Error::init(
                "max_concurrent_timeseries cannot be bigger than max_concurrent_reads",
            ));
        }
        Ok(Self {
            reads: Arc::new(Semaphore::new(max_concurrent_reads)),
            timeseries: Arc::new(Semaphore::new(max_concurrent_timeseries)),
        })
    }

    /// Acquire one slot on each gate, reads first. May block on either.
    pub async fn acquire(&self) -> GateSlot {
        // Semaphores are never closed, acquisition cannot fail
        let reads = self
            .reads
            .clone()
            .acquire_owned()
            .await
            .expect("reads gate closed");
        let timeseries = self
            .timeseries
            .clone()
            .acquire_owned()
            .await
            .expect("timeseries gate closed");
        GateSlot {
            _timeseries: timeseries,
            _reads: reads,
        }
    }

    /// Free slots on the reads gate, for introspection
    pub fn available_reads(&self) -> usize {
        self.reads.available_permits()
    }

    /// Free slots on the timeseries gate, for introspection
    pub fn available_timeseries(&self) -> usize {
        self.timeseries.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rejects_inverted_capacities() {
        assert!(ConcurrencyGates::new(2, 5).is_err());
        assert!(ConcurrencyGates::new(0, 0).is_err());
        assert!(ConcurrencyGates::new(5, 5).is_ok());
    }

    #[tokio::test]
    async fn test_acquire_holds_both_gates() {
        let gates = ConcurrencyGates::new(2, 1).unwrap();

        let slot = gates.acquire().await;
        assert_eq!(gates.available_reads(), 1);
        assert_eq!(gates.available_timeseries(), 0);

        drop(slot);
        assert_eq!(gates.available_reads(), 2);
        assert_eq!(gates.available_timeseries(), 1);
    }

    #[tokio::test]
    async fn test_reads_capacity_bounds_parallelism() {
        let gates = ConcurrencyGates::new(1, 1).unwrap();

        let first = gates.acquire().await;

        let gates2 = gates.clone();
        let waiter = tokio::spawn(async move { gates2.acquire().await });

        // The second acquire must park until the first slot drops
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let _second = waiter.await.unwrap();
        assert_eq!(gates.available_reads(), 0);
    }
}
