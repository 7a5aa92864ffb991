//! Worker side of cooperative shard consumption: lease coordination,
//! shard and stream synchronization, and the scheduler that runs one
//! consumer per held shard.

pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod lease_coordinator;
pub mod lease_metrics;
pub mod retry;
pub mod scheduler;
pub mod service_configuration;
pub mod shard_info;
pub mod shard_sync;
pub mod standalone;
pub mod stream_sync;

pub use config::{LeaseManagementConfig, SchedulerConfig, StoreRetryConfig};
pub use diagnostics::{
    DiagnosticEvent, DiagnosticEventHandler, LoggingDiagnosticHandler, TaskErrorReporter,
    TaskRejection,
};
pub use errors::{Result, WorkerError};
pub use lease_coordinator::{LeaderDecider, LeaderState, LeaseCoordinator};
pub use retry::RetryPolicy;
pub use scheduler::{
    Scheduler, SchedulerComponents, ShardConsumer, ShardConsumerFactory, ShutdownReason,
    WorkerState, WorkerStateListener,
};
pub use service_configuration::{LoadConfiguration, WorkerConfiguration};
pub use shard_info::{ConcurrencyToken, ShardInfo, ShardInfoKey};
pub use shard_sync::{ShardDescription, ShardDetector, ShardSyncer, SyncReport};
pub use stream_sync::{DeletionStrategy, MultiStreamSynchronizer, StreamTracker};
