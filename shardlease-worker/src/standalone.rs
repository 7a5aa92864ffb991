//! Collaborators for running a worker without a stream service: a fixed
//! shard layout, the configured stream list, and shard consumers that only
//! log what they would process.

use async_trait::async_trait;
use shardlease_core::{InitialPosition, StreamConfig, StreamIdentifier};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info};

use crate::diagnostics::TaskErrorReporter;
use crate::scheduler::{ShardConsumer, ShardConsumerFactory, ShutdownReason};
use crate::service_configuration::WorkerConfiguration;
use crate::shard_info::ShardInfo;
use crate::shard_sync::{ShardDescription, ShardDetector};
use crate::stream_sync::{DeletionStrategy, StreamTracker};

/// Reports a fixed number of shards per stream, `shardId-000000000000` onwards.
#[derive(Debug, Clone, Default)]
pub struct StaticShardDetector {
    shard_counts: HashMap<StreamIdentifier, usize>,
}

impl StaticShardDetector {
    pub fn new(shard_counts: HashMap<StreamIdentifier, usize>) -> Self {
        Self { shard_counts }
    }
}

pub fn shard_id(index: usize) -> String {
    format!("shardId-{:012}", index)
}

#[async_trait]
impl ShardDetector for StaticShardDetector {
    async fn list_shards(&self, stream: &StreamConfig) -> anyhow::Result<Vec<ShardDescription>> {
        let count = self
            .shard_counts
            .get(&stream.stream_identifier)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown stream {}", stream.stream_identifier))?;
        Ok((0..count).map(|i| ShardDescription::new(shard_id(i))).collect())
    }
}

/// Tracks the streams listed in the worker configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredStreamTracker {
    streams: Vec<StreamConfig>,
    deletion_strategy: DeletionStrategy,
    orphaned_stream_initial_position: InitialPosition,
    multi_stream: bool,
}

impl ConfiguredStreamTracker {
    pub fn from_configuration(config: &WorkerConfiguration) -> Self {
        Self {
            streams: config.streams.clone(),
            deletion_strategy: config.deletion_strategy.clone(),
            orphaned_stream_initial_position: config.orphaned_stream_initial_position,
            multi_stream: config.multi_stream,
        }
    }
}

impl StreamTracker for ConfiguredStreamTracker {
    fn stream_config_list(&self) -> Vec<StreamConfig> {
        self.streams.clone()
    }

    fn former_streams_deletion_strategy(&self) -> DeletionStrategy {
        self.deletion_strategy.clone()
    }

    fn orphaned_stream_initial_position(&self) -> InitialPosition {
        self.orphaned_stream_initial_position
    }

    fn is_multi_stream(&self) -> bool {
        self.multi_stream
    }
}

/// Consumer running as a tokio task that logs its shard until stopped.
#[derive(Debug)]
pub struct LoggingShardConsumer {
    shutdown_tx: watch::Sender<Option<ShutdownReason>>,
    stopped: Arc<AtomicBool>,
}

impl ShardConsumer for LoggingShardConsumer {
    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_tx.borrow().is_some()
    }

    fn request_shutdown(&self, reason: ShutdownReason) {
        self.shutdown_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Spawns a [`LoggingShardConsumer`] per shard, at most `max_consumers` at once.
pub struct LoggingConsumerFactory {
    permits: Arc<Semaphore>,
    report_interval: Duration,
}

impl LoggingConsumerFactory {
    pub fn new(max_consumers: usize, report_interval: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_consumers)),
            report_interval,
        }
    }
}

impl ShardConsumerFactory for LoggingConsumerFactory {
    fn create(
        &self,
        shard: &ShardInfo,
        task_errors: TaskErrorReporter,
    ) -> anyhow::Result<Arc<dyn ShardConsumer>> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| anyhow::anyhow!("consumer pool saturated: {}", e))?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(None);
        let stopped = Arc::new(AtomicBool::new(false));
        let consumer = Arc::new(LoggingShardConsumer {
            shutdown_tx,
            stopped: stopped.clone(),
        });

        let lease_key = shard.lease_key.clone();
        let checkpoint = shard.checkpoint.clone();
        let interval = self.report_interval;
        runtime.spawn(async move {
            let _permit = permit;
            info!(lease_key = %lease_key, checkpoint = ?checkpoint, "shard consumer started");
            let mut ticker = tokio::time::interval(interval);
            let reason = loop {
                tokio::select! {
                    _ = ticker.tick() => debug!(lease_key = %lease_key, "shard consumer polling"),
                    changed = shutdown_rx.wait_for(Option::is_some) => {
                        match changed {
                            Ok(reason) => break *reason,
                            Err(e) => {
                                task_errors.report_rejection(lease_key.clone(), e);
                                break None;
                            }
                        }
                    }
                }
            };
            info!(lease_key = %lease_key, reason = ?reason, "shard consumer stopped");
            stopped.store(true, Ordering::SeqCst);
        });

        let handle: Arc<dyn ShardConsumer> = consumer;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard_info::ConcurrencyToken;
    use shardlease_core::{Checkpoint, Lease};

    fn shard_info(shard: &str) -> ShardInfo {
        ShardInfo::from_lease(
            &Lease::new(None, shard, Checkpoint::TrimHorizon),
            ConcurrencyToken::new(),
        )
    }

    #[tokio::test]
    async fn detector_lists_configured_shards() {
        let stream = StreamIdentifier::single_stream_instance("orders").unwrap();
        let detector = StaticShardDetector::new(HashMap::from([(stream.clone(), 3)]));
        let shards = detector
            .list_shards(&StreamConfig::new(stream, InitialPosition::Latest))
            .await
            .unwrap();
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[2].shard_id, "shardId-000000000002");

        let unknown = StreamIdentifier::single_stream_instance("payments").unwrap();
        assert!(detector
            .list_shards(&StreamConfig::new(unknown, InitialPosition::Latest))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn factory_rejects_when_saturated_and_consumers_stop() {
        let factory = LoggingConsumerFactory::new(1, Duration::from_millis(10));
        let (reporter, _rx) = TaskErrorReporter::channel();

        let consumer = factory.create(&shard_info("shard-0"), reporter.clone()).unwrap();
        assert!(factory.create(&shard_info("shard-1"), reporter.clone()).is_err());

        consumer.request_shutdown(ShutdownReason::LeaseLost);
        consumer.request_shutdown(ShutdownReason::Requested);
        assert!(consumer.is_shutdown_requested());
        for _ in 0..100 {
            if consumer.is_shutdown() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(consumer.is_shutdown());
        // permit released with the stopped consumer
        assert!(factory.create(&shard_info("shard-1"), reporter).is_ok());
    }
}
