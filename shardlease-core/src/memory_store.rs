use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::errors::{Result, StoreError};
use crate::lease::{Lease, UpdateOutcome};
use crate::store::{LeaseStore, WorkerMetricsStore};
use crate::worker_metrics::WorkerMetricSummary;

/// In-memory lease table with per-key atomic conditional writes.
/// SHOULD BE USED ONLY FOR TESTING AND LOCAL RUNS
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<DashMap<String, Lease>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Writes a lease unconditionally, bypassing the counter fence.
    pub fn put_raw(&self, lease: Lease) {
        self.leases.insert(lease.lease_key.clone(), lease);
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Serializes the whole table, ordered by lease key.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let mut leases: Vec<Lease> = self.leases.iter().map(|e| e.value().clone()).collect();
        leases.sort_by(|a, b| a.lease_key.cmp(&b.lease_key));
        Ok(serde_json::to_vec(&leases)?)
    }

    /// Replaces the table with the leases of a previous `snapshot`.
    pub fn restore(&self, bytes: &[u8]) -> Result<usize> {
        let leases: Vec<Lease> = serde_json::from_slice(bytes)?;
        self.leases.clear();
        let restored = leases.len();
        for lease in leases {
            self.leases.insert(lease.lease_key.clone(), lease);
        }
        Ok(restored)
    }

    fn check_injected_failure(&self) -> Result<()> {
        let consumed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Transient("injected store failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn list_leases(&self) -> Result<Vec<Lease>> {
        self.check_injected_failure()?;
        let mut leases: Vec<Lease> = self.leases.iter().map(|e| e.value().clone()).collect();
        leases.sort_by(|a, b| a.lease_key.cmp(&b.lease_key));
        Ok(leases)
    }

    async fn create_lease_if_absent(&self, lease: Lease) -> Result<bool> {
        self.check_injected_failure()?;
        if lease.lease_key.is_empty() {
            return Err(StoreError::InvalidArguments(
                "lease key must not be empty".to_string(),
            ));
        }
        match self.leases.entry(lease.lease_key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                trace!(lease_key = %lease.lease_key, "lease created");
                slot.insert(lease);
                Ok(true)
            }
        }
    }

    async fn update_lease_conditional(
        &self,
        lease: Lease,
        expected_counter: u64,
    ) -> Result<UpdateOutcome> {
        self.check_injected_failure()?;
        let mut stored = match self.leases.get_mut(&lease.lease_key) {
            Some(stored) => stored,
            None => return Ok(UpdateOutcome::NotFound),
        };
        if stored.lease_counter != expected_counter {
            return Ok(UpdateOutcome::VersionConflict);
        }
        let mut updated = lease;
        updated.lease_counter = expected_counter + 1;
        *stored = updated.clone();
        Ok(UpdateOutcome::Updated(updated))
    }

    async fn delete_lease(&self, lease_key: &str) -> Result<()> {
        self.check_injected_failure()?;
        self.leases.remove(lease_key);
        Ok(())
    }

    async fn is_table_empty(&self) -> Result<bool> {
        self.check_injected_failure()?;
        Ok(self.leases.is_empty())
    }

    async fn get_lease(&self, lease_key: &str) -> Result<Option<Lease>> {
        self.check_injected_failure()?;
        Ok(self.leases.get(lease_key).map(|l| l.value().clone()))
    }
}

/// In-memory worker metric summaries.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkerMetricsStore {
    summaries: Arc<DashMap<String, WorkerMetricSummary>>,
}

impl MemoryWorkerMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerMetricsStore for MemoryWorkerMetricsStore {
    async fn put_worker_metrics(&self, summary: WorkerMetricSummary) -> Result<()> {
        self.summaries.insert(summary.worker_id.clone(), summary);
        Ok(())
    }

    async fn list_worker_metrics(&self) -> Result<Vec<WorkerMetricSummary>> {
        let mut summaries: Vec<_> = self.summaries.iter().map(|e| e.value().clone()).collect();
        summaries.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(summaries)
    }

    async fn delete_worker_metrics(&self, worker_id: &str) -> Result<()> {
        self.summaries.remove(worker_id);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_store_test.rs"]
mod memory_store_test;
