use shardlease_core::{Checkpoint, Lease};
use std::fmt;
use uuid::Uuid;

/// Changes every time a lease is freshly acquired by this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConcurrencyToken(Uuid);

impl ConcurrencyToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConcurrencyToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of a shard consumer: a new token means a new consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardInfoKey {
    pub stream_identifier: Option<String>,
    pub shard_id: String,
    pub concurrency_token: ConcurrencyToken,
}

/// A shard currently held by this worker, as handed to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardInfo {
    pub lease_key: String,
    pub stream_identifier: Option<String>,
    pub shard_id: String,
    pub concurrency_token: ConcurrencyToken,
    pub parent_lease_keys: Vec<String>,
    /// Starting position, not part of the identity
    pub checkpoint: Checkpoint,
}

impl ShardInfo {
    pub fn from_lease(lease: &Lease, concurrency_token: ConcurrencyToken) -> Self {
        Self {
            lease_key: lease.lease_key.clone(),
            stream_identifier: lease.stream_identifier.clone(),
            shard_id: lease.shard_id.clone(),
            concurrency_token,
            parent_lease_keys: lease.parent_lease_keys(),
            checkpoint: lease.checkpoint.clone(),
        }
    }

    pub fn key(&self) -> ShardInfoKey {
        ShardInfoKey {
            stream_identifier: self.stream_identifier.clone(),
            shard_id: self.shard_id.clone(),
            concurrency_token: self.concurrency_token,
        }
    }
}
