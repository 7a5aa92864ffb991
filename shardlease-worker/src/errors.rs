use shardlease_core::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Lease store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker initialization failed after {attempts} attempts: {reason}")]
    Initialization { attempts: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Shard discovery failed for stream {stream}: {reason}")]
    ShardDiscovery { stream: String, reason: String },

    #[error("Executor {executor} rejected the task: {reason}")]
    TaskRejected { executor: String, reason: String },

    #[error("Worker is shutting down")]
    ShuttingDown,

    #[error("Worker cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

impl WorkerError {
    /// Whether the failed operation may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::ShardDiscovery { .. } => true,
            _ => false,
        }
    }
}
