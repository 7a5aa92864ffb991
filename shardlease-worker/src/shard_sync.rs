use async_trait::async_trait;
use shardlease_core::{Checkpoint, Lease, LeaseStore, StreamConfig, StreamIdentifier};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::errors::{Result, WorkerError};
use crate::lease_metrics::{LEASES_CREATED_TOTAL, LEASES_DELETED_TOTAL};
use crate::retry::RetryPolicy;

/// A shard as reported by the stream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    pub shard_id: String,
    pub parent_shard_ids: Vec<String>,
}

impl ShardDescription {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_ids: Vec::new(),
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
}

/// Lists the current shards of a stream.
#[async_trait]
pub trait ShardDetector: Send + Sync {
    async fn list_shards(&self, stream: &StreamConfig) -> anyhow::Result<Vec<ShardDescription>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub deleted: usize,
}

/// Keeps the lease table in line with the shards of tracked streams.
#[derive(Clone)]
pub struct ShardSyncer {
    store: Arc<dyn LeaseStore>,
    detector: Arc<dyn ShardDetector>,
    multi_stream: bool,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl ShardSyncer {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        detector: Arc<dyn ShardDetector>,
        multi_stream: bool,
        retry: RetryPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            detector,
            multi_stream,
            retry,
            shutdown,
        }
    }

    pub fn is_multi_stream(&self) -> bool {
        self.multi_stream
    }

    fn lease_stream<'a>(&self, stream: &'a StreamIdentifier) -> Option<&'a StreamIdentifier> {
        self.multi_stream.then_some(stream)
    }

    async fn stream_leases(&self, stream: &StreamIdentifier) -> Result<Vec<Lease>> {
        let mut shutdown = self.shutdown.clone();
        let leases = self
            .retry
            .run("list_leases", &mut shutdown, || self.store.list_leases())
            .await?;
        let serialized = self.lease_stream(stream).map(StreamIdentifier::serialize);
        Ok(leases
            .into_iter()
            .filter(|l| l.stream_identifier == serialized)
            .collect())
    }

    /// Creates leases for new shards and deletes leases of finished shards
    /// that the stream no longer lists.
    ///
    /// A shard whose parent is still known starts from the trim horizon so
    /// that records written after the split are not skipped; other shards
    /// start from the stream's initial position.
    pub async fn sync_stream(&self, config: &StreamConfig) -> Result<SyncReport> {
        let stream = &config.stream_identifier;
        let shards = self.detector.list_shards(config).await.map_err(|e| {
            WorkerError::ShardDiscovery {
                stream: stream.serialize(),
                reason: e.to_string(),
            }
        })?;
        let existing = self.stream_leases(stream).await?;

        let existing_shards: HashSet<&str> =
            existing.iter().map(|l| l.shard_id.as_str()).collect();
        let listed: HashSet<&str> = shards.iter().map(|s| s.shard_id.as_str()).collect();

        let mut report = SyncReport::default();
        for shard in &shards {
            if existing_shards.contains(shard.shard_id.as_str()) {
                continue;
            }
            let has_known_parent = shard.parent_shard_ids.iter().any(|p| {
                existing_shards.contains(p.as_str()) || listed.contains(p.as_str())
            });
            let checkpoint = if has_known_parent {
                Checkpoint::TrimHorizon
            } else {
                config.initial_position.initial_checkpoint()
            };
            let lease = Lease::new(self.lease_stream(stream), shard.shard_id.clone(), checkpoint)
                .with_parents(shard.parent_shard_ids.iter().cloned());

            let mut shutdown = self.shutdown.clone();
            let created = self
                .retry
                .run("create_lease", &mut shutdown, || {
                    self.store.create_lease_if_absent(lease.clone())
                })
                .await?;
            if created {
                debug!(stream = %stream, shard_id = %shard.shard_id, "lease created for new shard");
                report.created += 1;
            }
        }

        for lease in existing
            .iter()
            .filter(|l| l.is_shard_end() && !listed.contains(l.shard_id.as_str()))
        {
            let mut shutdown = self.shutdown.clone();
            self.retry
                .run("delete_lease", &mut shutdown, || {
                    self.store.delete_lease(&lease.lease_key)
                })
                .await?;
            debug!(stream = %stream, lease_key = %lease.lease_key, "lease of expired shard deleted");
            report.deleted += 1;
        }

        metrics::counter!(LEASES_CREATED_TOTAL.name).increment(report.created as u64);
        metrics::counter!(LEASES_DELETED_TOTAL.name).increment(report.deleted as u64);
        if report.created > 0 || report.deleted > 0 {
            info!(
                stream = %stream,
                created = report.created,
                deleted = report.deleted,
                "shard sync completed"
            );
        }
        Ok(report)
    }

    /// Deletes every lease of `stream`, returning how many were removed.
    pub async fn delete_stream_leases(&self, stream: &StreamIdentifier) -> Result<usize> {
        let leases = self.stream_leases(stream).await?;
        for lease in &leases {
            let mut shutdown = self.shutdown.clone();
            self.retry
                .run("delete_lease", &mut shutdown, || {
                    self.store.delete_lease(&lease.lease_key)
                })
                .await?;
        }
        metrics::counter!(LEASES_DELETED_TOTAL.name).increment(leases.len() as u64);
        info!(stream = %stream, deleted = leases.len(), "leases of untracked stream deleted");
        Ok(leases.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlease_core::{InitialPosition, MemoryLeaseStore};
    use std::sync::Mutex;

    struct FixedShards(Mutex<Vec<ShardDescription>>);

    #[async_trait]
    impl ShardDetector for FixedShards {
        async fn list_shards(&self, _stream: &StreamConfig) -> anyhow::Result<Vec<ShardDescription>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn syncer(store: &MemoryLeaseStore, detector: Arc<FixedShards>, multi: bool) -> ShardSyncer {
        let (_tx, rx) = watch::channel(false);
        ShardSyncer::new(
            Arc::new(store.clone()),
            detector,
            multi,
            RetryPolicy::new(2, 1, 2),
            rx,
        )
    }

    #[tokio::test]
    async fn creates_missing_leases_with_initial_position() {
        let store = MemoryLeaseStore::new();
        let detector = Arc::new(FixedShards(Mutex::new(vec![
            ShardDescription::new("shard-0"),
            ShardDescription::new("shard-1"),
            ShardDescription::new("shard-2").with_parents(["shard-0"]),
        ])));
        let stream = StreamIdentifier::multi_stream_instance("123:orders:1").unwrap();
        let config = StreamConfig::new(stream, InitialPosition::Latest);

        let s = syncer(&store, detector, true);
        assert_eq!(s.sync_stream(&config).await.unwrap().created, 3);
        assert_eq!(s.sync_stream(&config).await.unwrap(), SyncReport::default());

        let leases = store.list_leases().await.unwrap();
        let child = leases.iter().find(|l| l.shard_id == "shard-2").unwrap();
        assert_eq!(child.lease_key, "123:orders:1:shard-2");
        assert_eq!(child.checkpoint, Checkpoint::TrimHorizon);
        let root = leases.iter().find(|l| l.shard_id == "shard-0").unwrap();
        assert_eq!(root.checkpoint, Checkpoint::Latest);
    }

    #[tokio::test]
    async fn deletes_only_finished_unlisted_shards() {
        let store = MemoryLeaseStore::new();
        let detector = Arc::new(FixedShards(Mutex::new(vec![
            ShardDescription::new("shard-0"),
            ShardDescription::new("shard-1"),
        ])));
        let stream = StreamIdentifier::single_stream_instance("orders").unwrap();
        let config = StreamConfig::new(stream, InitialPosition::TrimHorizon);
        let s = syncer(&store, detector.clone(), false);
        s.sync_stream(&config).await.unwrap();

        let mut done = store.get_lease("shard-0").await.unwrap().unwrap();
        done.checkpoint = Checkpoint::ShardEnd;
        store.put_raw(done);
        *detector.0.lock().unwrap() = vec![];

        let report = s.sync_stream(&config).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.get_lease("shard-0").await.unwrap().is_none());
        assert!(store.get_lease("shard-1").await.unwrap().is_some());
    }
}
