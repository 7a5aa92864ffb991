use std::fmt;
use std::sync::Arc;

use crate::diagnostics::TaskErrorReporter;
use crate::shard_info::ShardInfo;

/// Why a shard consumer is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The lease moved to another worker or expired.
    LeaseLost,
    /// The worker is shutting down.
    Requested,
    /// The shard has been fully consumed.
    ShardEnd,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::LeaseLost => write!(f, "lease_lost"),
            ShutdownReason::Requested => write!(f, "requested"),
            ShutdownReason::ShardEnd => write!(f, "shard_end"),
        }
    }
}

/// Handle to the processing of one shard.
///
/// Shutdown is asynchronous: `request_shutdown` only signals, and
/// `is_shutdown` turns true once the consumer has actually stopped.
pub trait ShardConsumer: Send + Sync {
    fn is_shutdown_requested(&self) -> bool;

    fn request_shutdown(&self, reason: ShutdownReason);

    fn is_shutdown(&self) -> bool;
}

/// Builds shard consumers for the shards this worker holds.
///
/// An error means the execution layer could not accept the consumer; the
/// scheduler reports it as a rejected task and retries on its next loop.
pub trait ShardConsumerFactory: Send + Sync {
    fn create(
        &self,
        shard: &ShardInfo,
        task_errors: TaskErrorReporter,
    ) -> anyhow::Result<Arc<dyn ShardConsumer>>;
}
