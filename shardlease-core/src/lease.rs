use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::stream::StreamIdentifier;

/// Last durably processed position of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Checkpoint {
    TrimHorizon,
    Latest,
    AtTimestamp(u64),
    Sequence(String),
    /// The shard has been fully consumed; children may start.
    ShardEnd,
}

impl Checkpoint {
    pub fn is_shard_end(&self) -> bool {
        matches!(self, Checkpoint::ShardEnd)
    }
}

/// Builds the lease key of a shard.
///
/// Multi-stream leases are prefixed with the serialized stream identifier so
/// that shards with the same id in different streams never collide.
pub fn lease_key_for(stream: Option<&StreamIdentifier>, shard_id: &str) -> String {
    match stream {
        Some(stream) => format!("{}:{}", stream.serialize(), shard_id),
        None => shard_id.to_owned(),
    }
}

/// Ownership claim over one shard, as persisted in the lease table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_key: String,
    /// Serialized stream identifier, only set in multi-stream mode.
    pub stream_identifier: Option<String>,
    pub shard_id: String,
    /// Worker holding the lease, `None` when unowned.
    pub owner: Option<String>,
    /// Bumped by the store on every successful conditional write.
    pub lease_counter: u64,
    pub checkpoint: Checkpoint,
    pub owner_switches_since_checkpoint: u64,
    pub parent_shard_ids: BTreeSet<String>,
    pub throughput_kbps: Option<f64>,
}

impl Lease {
    pub fn new(
        stream: Option<&StreamIdentifier>,
        shard_id: impl Into<String>,
        checkpoint: Checkpoint,
    ) -> Self {
        let shard_id = shard_id.into();
        Self {
            lease_key: lease_key_for(stream, &shard_id),
            stream_identifier: stream.map(StreamIdentifier::serialize),
            shard_id,
            owner: None,
            lease_counter: 0,
            checkpoint,
            owner_switches_since_checkpoint: 0,
            parent_shard_ids: BTreeSet::new(),
            throughput_kbps: None,
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_shard_ids = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_throughput(mut self, kbps: f64) -> Self {
        self.throughput_kbps = Some(kbps);
        self
    }

    pub fn is_unowned(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner.as_deref() == Some(worker_id)
    }

    pub fn is_shard_end(&self) -> bool {
        self.checkpoint.is_shard_end()
    }

    /// Lease keys of the parent shards, in the same keyspace as this lease.
    pub fn parent_lease_keys(&self) -> Vec<String> {
        self.parent_shard_ids
            .iter()
            .map(|parent| match &self.stream_identifier {
                Some(stream) => format!("{}:{}", stream, parent),
                None => parent.clone(),
            })
            .collect()
    }

    /// Copy of this lease reassigned to `new_owner`, counting the switch.
    pub fn transferred_to(&self, new_owner: Option<&str>) -> Self {
        let mut lease = self.clone();
        if lease.owner.as_deref() != new_owner {
            lease.owner_switches_since_checkpoint += 1;
        }
        lease.owner = new_owner.map(str::to_owned);
        lease
    }
}

/// Result of a conditional lease update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The write was applied; carries the stored lease with its new counter.
    Updated(Lease),
    /// The stored counter no longer matched the expected one.
    VersionConflict,
    NotFound,
}

impl UpdateOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}
