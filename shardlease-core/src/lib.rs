mod errors;
pub use errors::{Result, StoreError};

mod lease;
pub use lease::{lease_key_for, Checkpoint, Lease, UpdateOutcome};

mod stream;
pub use stream::{InitialPosition, StreamConfig, StreamIdentifier};

mod arn_cache;
pub use arn_cache::StreamArnCache;

mod worker_metrics;
pub use worker_metrics::{
    ema, MetricStats, MetricType, OperatingRange, WorkerMetricSummary, MAX_UTILIZATION,
};

mod store;
pub use store::{LeaseStore, WorkerMetricsStore};

mod memory_store;
pub use memory_store::{MemoryLeaseStore, MemoryWorkerMetricsStore};
