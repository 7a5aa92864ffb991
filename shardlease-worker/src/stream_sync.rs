use shardlease_core::{
    InitialPosition, Lease, LeaseStore, StreamArnCache, StreamConfig, StreamIdentifier,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::lease_metrics::{STREAM_SYNC_DURATION_SECONDS, TRACKED_STREAMS};
use crate::retry::RetryPolicy;
use crate::shard_sync::ShardSyncer;

/// How leases of streams that are no longer tracked get cleaned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionStrategy {
    /// Untracked streams are dropped from tracking, their leases are kept.
    None,
    /// Streams missing from the tracker list are deleted after `wait_period`.
    AutoDetectDeferred { wait_period: Duration },
    /// Only the named streams are deleted, after `wait_period`, once they are
    /// missing from the tracker list.
    ProvidedList {
        stream_identifiers: Option<Vec<StreamIdentifier>>,
        wait_period: Duration,
    },
}

impl DeletionStrategy {
    pub fn wait_period(&self) -> Option<Duration> {
        match self {
            DeletionStrategy::None => None,
            DeletionStrategy::AutoDetectDeferred { wait_period }
            | DeletionStrategy::ProvidedList { wait_period, .. } => Some(*wait_period),
        }
    }
}

/// Source of the streams this application consumes.
pub trait StreamTracker: Send + Sync {
    fn stream_config_list(&self) -> Vec<StreamConfig>;

    fn former_streams_deletion_strategy(&self) -> DeletionStrategy;

    /// Initial position for streams found only in the lease table.
    fn orphaned_stream_initial_position(&self) -> InitialPosition {
        InitialPosition::Latest
    }

    fn is_multi_stream(&self) -> bool {
        true
    }
}

/// Reconciles the tracked streams against the streams known to the lease
/// table, creating leases for new streams and deleting leases of streams
/// that stopped being tracked.
pub struct MultiStreamSynchronizer {
    tracker: Arc<dyn StreamTracker>,
    store: Arc<dyn LeaseStore>,
    syncer: ShardSyncer,
    arn_cache: StreamArnCache,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
    current_stream_config_map: HashMap<StreamIdentifier, StreamConfig>,
    stale_stream_deletion_map: HashMap<StreamIdentifier, Instant>,
    stream_sync_interval: Duration,
    last_sync: Option<Instant>,
    reconciled_from_lease_table: bool,
}

impl MultiStreamSynchronizer {
    pub fn new(
        tracker: Arc<dyn StreamTracker>,
        store: Arc<dyn LeaseStore>,
        syncer: ShardSyncer,
        arn_cache: StreamArnCache,
        retry: RetryPolicy,
        stream_sync_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            tracker,
            store,
            syncer,
            arn_cache,
            retry,
            shutdown,
            current_stream_config_map: HashMap::new(),
            stale_stream_deletion_map: HashMap::new(),
            stream_sync_interval,
            last_sync: None,
            reconciled_from_lease_table: false,
        }
    }

    pub fn syncer(&self) -> &ShardSyncer {
        &self.syncer
    }

    pub fn is_multi_stream(&self) -> bool {
        self.tracker.is_multi_stream()
    }

    pub fn current_streams(&self) -> Vec<StreamIdentifier> {
        let mut streams: Vec<_> = self.current_stream_config_map.keys().cloned().collect();
        streams.sort();
        streams
    }

    pub fn current_stream_configs(&self) -> Vec<StreamConfig> {
        let mut configs: Vec<_> = self.current_stream_config_map.values().cloned().collect();
        configs.sort_by(|a, b| a.stream_identifier.cmp(&b.stream_identifier));
        configs
    }

    pub fn stream_config(&self, stream: &StreamIdentifier) -> Option<&StreamConfig> {
        self.current_stream_config_map.get(stream)
    }

    pub fn stale_streams(&self) -> Vec<StreamIdentifier> {
        let mut streams: Vec<_> = self.stale_stream_deletion_map.keys().cloned().collect();
        streams.sort();
        streams
    }

    /// Starts tracking `config` without running a shard sync.
    pub fn track(&mut self, config: StreamConfig) {
        self.activate(config);
    }

    pub fn should_sync_streams_now(&self) -> bool {
        self.last_sync
            .map_or(true, |last| last.elapsed() >= self.stream_sync_interval)
    }

    /// The streams of the tracker list, keyed by identifier.
    ///
    /// In single-stream mode only the first configured stream is used.
    fn tracked_stream_map(&self) -> HashMap<StreamIdentifier, StreamConfig> {
        let configs = self.tracker.stream_config_list();
        let take = if self.is_multi_stream() { configs.len() } else { 1 };
        configs
            .into_iter()
            .take(take)
            .map(|c| (c.stream_identifier.clone(), c))
            .collect()
    }

    /// Starts tracking `config`, resolving its ARN when it has none.
    fn activate(&mut self, mut config: StreamConfig) {
        if config.stream_arn.is_none() {
            config.stream_arn = Some(self.arn_cache.arn_for(&config.stream_identifier));
        }
        self.current_stream_config_map
            .insert(config.stream_identifier.clone(), config);
    }

    /// Tracks every stream that owns leases but is neither tracked yet nor
    /// listed by the tracker, using the orphaned-stream initial position.
    /// Streams the tracker lists keep the tracker's config and are synced
    /// as new streams. Returns how many were added.
    pub fn sync_streams_from_lease_table(&mut self, leases: &[Lease]) -> usize {
        self.reconciled_from_lease_table = true;
        let tracked = self.tracked_stream_map();
        let mut found = HashSet::new();
        for serialized in leases.iter().filter_map(|l| l.stream_identifier.as_deref()) {
            match StreamIdentifier::multi_stream_instance(serialized) {
                Ok(stream) => {
                    found.insert(stream);
                }
                Err(e) => warn!(stream = %serialized, error = %e, "skipping lease with unparsable stream identifier"),
            }
        }

        let mut added = 0;
        for stream in found {
            if self.current_stream_config_map.contains_key(&stream) || tracked.contains_key(&stream) {
                continue;
            }
            info!(stream = %stream, "tracking orphaned stream found in the lease table");
            let position = self.tracker.orphaned_stream_initial_position();
            self.activate(StreamConfig::new(stream, position));
            added += 1;
        }
        added
    }

    async fn list_leases(&self) -> Result<Vec<Lease>> {
        let mut shutdown = self.shutdown.clone();
        self.retry
            .run("list_leases", &mut shutdown, || self.store.list_leases())
            .await
    }

    /// Runs one synchronization pass and returns the streams whose
    /// tracking state changed: newly synced streams and streams that were
    /// dropped.
    ///
    /// Without `force`, the pass is skipped until the stream sync interval
    /// has elapsed since the previous one.
    pub async fn check_and_sync_streams(
        &mut self,
        force: bool,
    ) -> Result<HashSet<StreamIdentifier>> {
        let mut synced = HashSet::new();
        if !force && !self.should_sync_streams_now() {
            return Ok(synced);
        }
        let started = Instant::now();
        let multi_stream = self.is_multi_stream();

        if multi_stream && !self.reconciled_from_lease_table {
            let leases = self.list_leases().await?;
            self.sync_streams_from_lease_table(&leases);
        }

        let new_map = self.tracked_stream_map();

        let mut new_configs: Vec<StreamConfig> = new_map
            .values()
            .filter(|c| !self.current_stream_config_map.contains_key(&c.stream_identifier))
            .cloned()
            .collect();
        new_configs.sort_by(|a, b| a.stream_identifier.cmp(&b.stream_identifier));
        for config in new_configs {
            match self.syncer.sync_stream(&config).await {
                Ok(report) => {
                    debug!(
                        stream = %config.stream_identifier,
                        created = report.created,
                        "new stream synced"
                    );
                    synced.insert(config.stream_identifier.clone());
                    self.activate(config);
                }
                Err(e) => warn!(
                    stream = %config.stream_identifier,
                    error = %e,
                    "shard sync failed for new stream, retrying next pass"
                ),
            }
        }

        if multi_stream {
            let now = Instant::now();
            let strategy = self.tracker.former_streams_deletion_strategy();
            match &strategy {
                DeletionStrategy::None => {
                    let absent: Vec<_> = self
                        .current_stream_config_map
                        .keys()
                        .filter(|s| !new_map.contains_key(*s))
                        .cloned()
                        .collect();
                    for stream in absent {
                        info!(stream = %stream, "stream no longer tracked, leases kept");
                        self.current_stream_config_map.remove(&stream);
                        synced.insert(stream);
                    }
                }
                DeletionStrategy::AutoDetectDeferred { .. } => {
                    for stream in self.current_stream_config_map.keys() {
                        if !new_map.contains_key(stream) {
                            self.stale_stream_deletion_map
                                .entry(stream.clone())
                                .or_insert(now);
                        }
                    }
                }
                DeletionStrategy::ProvidedList {
                    stream_identifiers, ..
                } => {
                    for stream in stream_identifiers.iter().flatten() {
                        if !new_map.contains_key(stream) {
                            self.stale_stream_deletion_map
                                .entry(stream.clone())
                                .or_insert(now);
                        }
                    }
                }
            }

            self.stale_stream_deletion_map.retain(|stream, _| {
                let revived = new_map.contains_key(stream);
                if revived {
                    debug!(stream = %stream, "stale stream is tracked again");
                }
                !revived
            });

            if let Some(wait_period) = strategy.wait_period() {
                let mut expired: Vec<_> = self
                    .stale_stream_deletion_map
                    .iter()
                    .filter(|(_, since)| now.duration_since(**since) >= wait_period)
                    .map(|(s, _)| s.clone())
                    .collect();
                expired.sort();
                for stream in expired {
                    match self.syncer.delete_stream_leases(&stream).await {
                        Ok(_) => {
                            self.current_stream_config_map.remove(&stream);
                            self.stale_stream_deletion_map.remove(&stream);
                            self.arn_cache.invalidate(&stream);
                            synced.insert(stream);
                        }
                        Err(e) => warn!(
                            stream = %stream,
                            error = %e,
                            "failed to delete leases of stale stream, retrying next pass"
                        ),
                    }
                }
            }
        }

        self.last_sync = Some(Instant::now());
        metrics::gauge!(TRACKED_STREAMS.name).set(self.current_stream_config_map.len() as f64);
        metrics::histogram!(STREAM_SYNC_DURATION_SECONDS.name)
            .record(started.elapsed().as_secs_f64());
        Ok(synced)
    }
}

#[cfg(test)]
#[path = "stream_sync_test.rs"]
mod stream_sync_test;
