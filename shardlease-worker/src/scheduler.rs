mod consumer;

pub use consumer::{ShardConsumer, ShardConsumerFactory, ShutdownReason};

use dashmap::DashMap;
use rand::{rng, Rng};
use shardlease_balancer::WorkerMetricsAggregator;
use shardlease_core::{Lease, LeaseStore, StreamArnCache};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::diagnostics::{
    drain_rejections, DiagnosticEvent, DiagnosticEventHandler, LoggingDiagnosticHandler,
    TaskErrorReporter, TaskRejection,
};
use crate::errors::{Result, WorkerError};
use crate::lease_coordinator::LeaseCoordinator;
use crate::lease_metrics::ACTIVE_SHARD_CONSUMERS;
use crate::retry::{sleep_or_shutdown, RetryPolicy};
use crate::shard_info::{ShardInfo, ShardInfoKey};
use crate::shard_sync::{ShardDetector, ShardSyncer};
use crate::stream_sync::{MultiStreamSynchronizer, StreamTracker};

const CONSUMER_EXECUTOR: &str = "shard-consumers";

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    ShutDown,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Created => "created",
            WorkerState::Initializing => "initializing",
            WorkerState::Running => "running",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::ShutDown => "shut_down",
        };
        f.write_str(name)
    }
}

/// Notified on every worker state transition.
pub trait WorkerStateListener: Send + Sync {
    fn on_state_change(&self, state: WorkerState);
}

/// Collaborators the scheduler drives.
pub struct SchedulerComponents {
    pub lease_store: Arc<dyn LeaseStore>,
    pub coordinator: Arc<LeaseCoordinator>,
    pub stream_tracker: Arc<dyn StreamTracker>,
    pub shard_detector: Arc<dyn ShardDetector>,
    pub consumer_factory: Arc<dyn ShardConsumerFactory>,
    pub arn_cache: StreamArnCache,
}

/// Turns the leases held by this worker into running shard consumers.
///
/// After initialization the process loop repeatedly reads the coordinator's
/// assignments, creates a consumer for every assigned shard whose parents
/// are finished, signals consumers of shards no longer assigned, and
/// reconciles the tracked streams on its own interval. The consumer map is
/// only written from the process loop.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn LeaseStore>,
    coordinator: Arc<LeaseCoordinator>,
    synchronizer: Mutex<MultiStreamSynchronizer>,
    consumer_factory: Arc<dyn ShardConsumerFactory>,
    consumers: DashMap<ShardInfoKey, Arc<dyn ShardConsumer>>,
    aggregator: Option<WorkerMetricsAggregator>,
    diagnostics: Arc<dyn DiagnosticEventHandler>,
    task_errors: TaskErrorReporter,
    task_error_rx: Mutex<mpsc::UnboundedReceiver<TaskRejection>>,
    state_tx: watch::Sender<WorkerState>,
    listener: Option<Arc<dyn WorkerStateListener>>,
    retry: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    last_shard_sync: Mutex<Option<Instant>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, components: SchedulerComponents) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (task_errors, task_error_rx) = TaskErrorReporter::channel();
        let (state_tx, _) = watch::channel(WorkerState::Created);
        let retry = components.coordinator.config().retry_policy();

        let syncer = ShardSyncer::new(
            components.lease_store.clone(),
            components.shard_detector,
            components.stream_tracker.is_multi_stream(),
            retry.clone(),
            shutdown.clone(),
        );
        let synchronizer = MultiStreamSynchronizer::new(
            components.stream_tracker,
            components.lease_store.clone(),
            syncer,
            components.arn_cache,
            retry.clone(),
            config.stream_sync_interval(),
            shutdown,
        );

        Self {
            config,
            store: components.lease_store,
            coordinator: components.coordinator,
            synchronizer: Mutex::new(synchronizer),
            consumer_factory: components.consumer_factory,
            consumers: DashMap::new(),
            aggregator: None,
            diagnostics: Arc::new(LoggingDiagnosticHandler),
            task_errors,
            task_error_rx: Mutex::new(task_error_rx),
            state_tx,
            listener: None,
            retry,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
            last_shard_sync: Mutex::new(None),
        }
    }

    /// Samples and publishes this worker's utilization while running.
    pub fn with_metrics_aggregator(mut self, aggregator: WorkerMetricsAggregator) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn with_diagnostic_handler(mut self, handler: Arc<dyn DiagnosticEventHandler>) -> Self {
        self.diagnostics = handler;
        self
    }

    pub fn with_state_listener(mut self, listener: Arc<dyn WorkerStateListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<LeaseCoordinator> {
        &self.coordinator
    }

    pub fn task_error_reporter(&self) -> TaskErrorReporter {
        self.task_errors.clone()
    }

    pub fn active_consumers(&self) -> usize {
        self.consumers.len()
    }

    /// Moves the worker to `state`. States only move forward, so a
    /// transition that would go back (or stay put) is ignored and `false`
    /// is returned.
    fn set_state(&self, state: WorkerState) -> bool {
        let mut previous = state;
        let changed = self.state_tx.send_if_modified(|current| {
            if *current >= state {
                return false;
            }
            previous = std::mem::replace(current, state);
            true
        });
        if !changed {
            return false;
        }
        info!(
            worker_id = %self.coordinator.worker_id(),
            from = %previous,
            to = %state,
            "worker state changed"
        );
        if let Some(listener) = &self.listener {
            listener.on_state_change(state);
        }
        true
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Brings the worker to `Running`.
    ///
    /// Each attempt initializes the lease coordinator, syncs shards when the
    /// lease table needs it, reconciles the tracked streams and starts the
    /// coordinator loops. Failed attempts are retried after the configured
    /// backoff; running out of attempts returns
    /// [`WorkerError::Initialization`].
    pub async fn initialize(&self) -> Result<()> {
        let state = self.state();
        if state != WorkerState::Created || self.is_shutting_down() {
            return Err(WorkerError::InvalidState {
                action: "initialize",
                state: state.to_string(),
            });
        }
        self.set_state(WorkerState::Initializing);

        let attempts = self.config.max_initialization_attempts.max(1);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.try_initialize().await {
                Ok(()) => {
                    if self.is_shutting_down() {
                        return Err(WorkerError::ShuttingDown);
                    }
                    self.start_aggregator().await;
                    if !self.set_state(WorkerState::Running) {
                        return Err(WorkerError::ShuttingDown);
                    }
                    return Ok(());
                }
                Err(WorkerError::ShuttingDown) => return Err(WorkerError::ShuttingDown),
                Err(e) => {
                    warn!(
                        worker_id = %self.coordinator.worker_id(),
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "worker initialization attempt failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < attempts
                && !sleep_or_shutdown(self.config.initialization_backoff(), &mut shutdown).await
            {
                return Err(WorkerError::ShuttingDown);
            }
        }

        self.set_state(WorkerState::ShutDown);
        Err(WorkerError::Initialization {
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn try_initialize(&self) -> Result<()> {
        self.coordinator.initialize().await?;

        let mut sync = self.synchronizer.lock().await;
        if sync.is_multi_stream() {
            let leases = self.coordinator.all_leases_snapshot().await;
            let orphans = sync.sync_streams_from_lease_table(&leases);
            if orphans > 0 {
                info!(orphans = orphans, "tracking streams reconstructed from the lease table");
            }
        }

        let table_empty = self.is_table_empty().await?;
        if !self.config.skip_shard_sync_at_worker_initialization_if_leases_exist || table_empty {
            if self.should_initiate_lease_sync().await? {
                info!("lease table is empty, syncing shards of tracked streams");
                sync.check_and_sync_streams(true).await?;
            } else {
                debug!("lease table populated by another worker, skipping initial shard sync");
            }
        }
        drop(sync);

        if self.is_shutting_down() {
            return Err(WorkerError::ShuttingDown);
        }
        self.coordinator.start().await;
        Ok(())
    }

    async fn is_table_empty(&self) -> Result<bool> {
        let mut shutdown = self.shutdown_tx.subscribe();
        self.retry
            .run("is_table_empty", &mut shutdown, || self.store.is_table_empty())
            .await
    }

    async fn start_aggregator(&self) {
        if let Some(aggregator) = &self.aggregator {
            let handles = aggregator.start(self.shutdown_tx.subscribe());
            self.background.lock().await.extend(handles);
        }
    }

    /// Waits a random time in `[min, max)` of the lease table wait window,
    /// checking the table every check interval, and returns whether it is
    /// still empty.
    ///
    /// Workers starting together against an empty table spread out this
    /// way, so usually only one of them runs the initial shard sync.
    pub async fn should_initiate_lease_sync(&self) -> Result<bool> {
        let min = self.config.min_lease_table_wait_millis;
        let max = self.config.max_lease_table_wait_millis;
        let wait_ms = if max > min {
            rng().random_range(min..max)
        } else {
            min
        };
        let wait = Duration::from_millis(wait_ms);
        let check_frequency = self.config.lease_table_check_frequency();

        let started = Instant::now();
        let mut shutdown = self.shutdown_tx.subscribe();
        while started.elapsed() <= wait {
            if !self.is_table_empty().await? {
                return Ok(false);
            }
            debug!(
                waited_ms = started.elapsed().as_millis() as u64,
                wait_ms = wait_ms,
                "lease table is empty, waiting before shard sync"
            );
            if !sleep_or_shutdown(check_frequency, &mut shutdown).await {
                return Err(WorkerError::ShuttingDown);
            }
        }
        self.is_table_empty().await
    }

    /// Initializes the worker and runs the process loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.initialize().await?;
        let mut shutdown = self.shutdown_tx.subscribe();
        let poll = self.config.dispatch_poll_interval();
        loop {
            self.run_process_loop().await;
            if !sleep_or_shutdown(poll, &mut shutdown).await {
                break;
            }
        }
        Ok(())
    }

    /// One iteration of the process loop.
    pub async fn run_process_loop(&self) {
        let assignments = self.coordinator.current_assignments().await;
        let all_leases = self.coordinator.all_leases_snapshot().await;
        let leases_by_key: HashMap<&str, &Lease> =
            all_leases.iter().map(|l| (l.lease_key.as_str(), l)).collect();

        let mut assigned = HashSet::with_capacity(assignments.len());
        for shard in &assignments {
            assigned.insert(shard.key());
            if shard.checkpoint.is_shard_end() {
                self.finish_shard(shard);
                continue;
            }
            if let Some(parent) = unfinished_parent(shard, &leases_by_key) {
                debug!(
                    lease_key = %shard.lease_key,
                    parent = %parent,
                    "deferring shard until its parent reaches shard end"
                );
                continue;
            }
            if let Err(e) = self.create_or_get_shard_consumer(shard) {
                self.task_errors.report_rejection(CONSUMER_EXECUTOR, e);
            }
        }

        self.cleanup_shard_consumers(&assigned);
        self.dispatch_diagnostics().await;
        self.maybe_sync_shards().await;
        self.maybe_sync_streams().await;
    }

    /// Returns the consumer for `shard`, creating it on first use.
    ///
    /// Consumers are keyed by shard and concurrency token, so a lease
    /// reacquired under a new token gets a fresh consumer.
    pub fn create_or_get_shard_consumer(&self, shard: &ShardInfo) -> Result<Arc<dyn ShardConsumer>> {
        let key = shard.key();
        if let Some(existing) = self.consumers.get(&key) {
            return Ok(existing.value().clone());
        }
        let consumer = self
            .consumer_factory
            .create(shard, self.task_errors.clone())
            .map_err(|e| WorkerError::TaskRejected {
                executor: CONSUMER_EXECUTOR.to_string(),
                reason: format!("{}: {}", shard.lease_key, e),
            })?;
        info!(
            lease_key = %shard.lease_key,
            concurrency_token = %shard.concurrency_token,
            checkpoint = ?shard.checkpoint,
            "shard consumer created"
        );
        let consumer = self.consumers.entry(key).or_insert(consumer).value().clone();
        metrics::gauge!(ACTIVE_SHARD_CONSUMERS.name).set(self.consumers.len() as f64);
        Ok(consumer)
    }

    /// Asks the consumer of a fully consumed shard to stop. No consumer is
    /// created for it.
    fn finish_shard(&self, shard: &ShardInfo) {
        if let Some(consumer) = self.consumers.get(&shard.key()) {
            if !consumer.is_shutdown_requested() {
                info!(lease_key = %shard.lease_key, "shard fully consumed, shutting down shard consumer");
                consumer.request_shutdown(ShutdownReason::ShardEnd);
            }
        }
    }

    /// Signals consumers of shards outside `assigned` and forgets every
    /// consumer that has stopped, assigned or not. A consumer that stopped
    /// while its shard is still held is created again on the next loop.
    /// Never waits for a consumer.
    pub fn cleanup_shard_consumers(&self, assigned: &HashSet<ShardInfoKey>) {
        let mut stopped = Vec::new();
        for entry in self.consumers.iter() {
            let consumer = entry.value();
            if !assigned.contains(entry.key()) && !consumer.is_shutdown_requested() {
                info!(
                    shard_id = %entry.key().shard_id,
                    concurrency_token = %entry.key().concurrency_token,
                    "lease no longer held, shutting down shard consumer"
                );
                consumer.request_shutdown(ShutdownReason::LeaseLost);
            }
            if consumer.is_shutdown() {
                stopped.push(entry.key().clone());
            }
        }
        for key in stopped {
            self.consumers.remove(&key);
        }
        metrics::gauge!(ACTIVE_SHARD_CONSUMERS.name).set(self.consumers.len() as f64);
    }

    async fn dispatch_diagnostics(&self) {
        let rejections = drain_rejections(&mut *self.task_error_rx.lock().await);
        let pending_errors = rejections.len();
        for rejection in rejections {
            self.diagnostics.handle(&DiagnosticEvent::from(rejection));
        }
        self.diagnostics.handle(&DiagnosticEvent::ExecutorState {
            active_consumers: self.consumers.len(),
            pending_errors,
        });
    }

    /// Periodic shard sync of every tracked stream, run by the leader only.
    async fn maybe_sync_shards(&self) {
        let interval = self.coordinator.config().shard_sync_interval();
        let mut last = self.last_shard_sync.lock().await;
        if last.is_some_and(|t| t.elapsed() < interval) {
            return;
        }
        *last = Some(Instant::now());
        drop(last);
        if !self.coordinator.is_leader().await {
            return;
        }

        let sync = self.synchronizer.lock().await;
        for config in sync.current_stream_configs() {
            if let Err(e) = sync.syncer().sync_stream(&config).await {
                warn!(
                    stream = %config.stream_identifier,
                    error = %e,
                    "periodic shard sync failed, retrying next interval"
                );
            }
        }
    }

    /// Reconciles the tracked streams once the stream sync interval is due.
    /// Only the leader creates and deletes leases for stream changes.
    async fn maybe_sync_streams(&self) {
        let mut sync = self.synchronizer.lock().await;
        if !sync.should_sync_streams_now() || !self.coordinator.is_leader().await {
            return;
        }
        match sync.check_and_sync_streams(false).await {
            Ok(synced) if !synced.is_empty() => {
                info!(streams = synced.len(), "tracked streams reconciled")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stream sync failed, retrying next interval"),
        }
    }

    /// Stops the worker.
    ///
    /// Every consumer is asked to shut down without waiting for it, the
    /// coordinator releases its leases, and the state ends at `ShutDown`.
    /// Calling it again has no effect.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        self.set_state(WorkerState::ShuttingDown);

        for entry in self.consumers.iter() {
            if !entry.value().is_shutdown_requested() {
                entry.value().request_shutdown(ShutdownReason::Requested);
            }
        }
        self.coordinator.stop().await;

        let tasks: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.set_state(WorkerState::ShutDown);
        info!(worker_id = %self.coordinator.worker_id(), "worker shut down");
    }
}

/// First parent lease of `shard` that still has records to consume.
///
/// Parents missing from the table have had their lineage cleaned up and
/// count as finished.
fn unfinished_parent<'a>(shard: &'a ShardInfo, leases: &HashMap<&str, &Lease>) -> Option<&'a str> {
    shard
        .parent_lease_keys
        .iter()
        .find(|key| {
            leases
                .get(key.as_str())
                .is_some_and(|parent| !parent.is_shard_end())
        })
        .map(String::as_str)
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
