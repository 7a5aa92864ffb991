use async_trait::async_trait;

use crate::errors::Result;
use crate::lease::{Lease, UpdateOutcome};
use crate::worker_metrics::WorkerMetricSummary;

/// Typed access to the shared lease table.
///
/// Every mutating call must be atomic at the store. The lease counter is
/// the optimistic-concurrency fence: a successful conditional update stores
/// `expected_counter + 1`, whatever counter the caller passed in.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    async fn list_leases(&self) -> Result<Vec<Lease>>;

    /// Returns `false` if a lease with the same key already exists.
    async fn create_lease_if_absent(&self, lease: Lease) -> Result<bool>;

    async fn update_lease_conditional(
        &self,
        lease: Lease,
        expected_counter: u64,
    ) -> Result<UpdateOutcome>;

    async fn delete_lease(&self, lease_key: &str) -> Result<()>;

    async fn is_table_empty(&self) -> Result<bool>;

    async fn get_lease(&self, lease_key: &str) -> Result<Option<Lease>> {
        Ok(self
            .list_leases()
            .await?
            .into_iter()
            .find(|lease| lease.lease_key == lease_key))
    }

    /// Leases of one stream, by serialized stream identifier.
    async fn list_leases_for_stream(&self, stream: &str) -> Result<Vec<Lease>> {
        Ok(self
            .list_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.stream_identifier.as_deref() == Some(stream))
            .collect())
    }
}

/// Persistence of per-worker utilization summaries.
#[async_trait]
pub trait WorkerMetricsStore: Send + Sync + 'static {
    async fn put_worker_metrics(&self, summary: WorkerMetricSummary) -> Result<()>;
    async fn list_worker_metrics(&self) -> Result<Vec<WorkerMetricSummary>>;
    async fn delete_worker_metrics(&self, worker_id: &str) -> Result<()>;
}
