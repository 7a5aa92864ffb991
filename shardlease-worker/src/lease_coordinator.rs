mod leader;
mod renewer;
mod taker;

pub use leader::{LeaderDecider, LeaderState};

use shardlease_balancer::{AssignmentConfig, AssignmentEngine};
use shardlease_core::{Checkpoint, Lease, LeaseStore, UpdateOutcome, WorkerMetricsStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LeaseManagementConfig;
use crate::errors::{Result, WorkerError};
use crate::lease_metrics::{LEASES_HELD, LEASES_TAKEN_TOTAL};
use crate::retry::{sleep_or_shutdown, RetryPolicy};
use crate::shard_info::{ConcurrencyToken, ShardInfo};

/// A lease this worker believes it owns.
#[derive(Debug, Clone)]
pub(crate) struct HeldLease {
    pub(crate) lease: Lease,
    pub(crate) token: ConcurrencyToken,
    pub(crate) last_renewal: Instant,
}

/// Last counter seen for a lease and when it was first seen.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Observation {
    pub(crate) counter: u64,
    pub(crate) since: Instant,
}

pub(crate) struct CoordinatorState {
    pub(crate) worker_id: String,
    pub(crate) store: Arc<dyn LeaseStore>,
    pub(crate) metrics_store: Arc<dyn WorkerMetricsStore>,
    pub(crate) config: LeaseManagementConfig,
    pub(crate) assignment: AssignmentConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) held: RwLock<HashMap<String, HeldLease>>,
    pub(crate) all_leases: RwLock<Vec<Lease>>,
    pub(crate) observed: Mutex<HashMap<String, Observation>>,
    pub(crate) live_workers: RwLock<BTreeSet<String>>,
    pub(crate) leader: LeaderDecider,
    pub(crate) engine: Mutex<AssignmentEngine>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

/// Owns this worker's lease-holding state.
///
/// Three background loops share the state: the renewer keeps held leases
/// alive, the taker adopts leases assigned to this worker and claims
/// unowned or expired ones up to a fair share, and the rebalancer runs the
/// assignment engine while this worker is the leader. All cross-worker
/// coordination goes through conditional writes on the lease store.
pub struct LeaseCoordinator {
    state: Arc<CoordinatorState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LeaseCoordinator {
    pub fn new(
        worker_id: impl Into<String>,
        store: Arc<dyn LeaseStore>,
        metrics_store: Arc<dyn WorkerMetricsStore>,
        config: LeaseManagementConfig,
        assignment: AssignmentConfig,
    ) -> Self {
        let worker_id = worker_id.into();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let state = CoordinatorState {
            leader: LeaderDecider::new(worker_id.clone()),
            engine: Mutex::new(AssignmentEngine::new(assignment.clone())),
            retry: config.retry_policy(),
            worker_id,
            store,
            metrics_store,
            config,
            assignment,
            held: RwLock::new(HashMap::new()),
            all_leases: RwLock::new(Vec::new()),
            observed: Mutex::new(HashMap::new()),
            live_workers: RwLock::new(BTreeSet::new()),
            shutdown,
        };
        Self {
            state: Arc::new(state),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.state.worker_id
    }

    pub fn config(&self) -> &LeaseManagementConfig {
        &self.state.config
    }

    /// Loads the lease table and adopts every lease already owned by this
    /// worker. Store failures that outlast the retry policy are returned.
    pub async fn initialize(&self) -> Result<()> {
        let mut shutdown = self.state.shutdown.clone();
        let leases = self
            .state
            .retry
            .run("list_leases", &mut shutdown, || self.state.store.list_leases())
            .await?;

        self.state.observe(&leases).await;
        let mine: Vec<Lease> = leases
            .iter()
            .filter(|l| l.is_owned_by(&self.state.worker_id))
            .cloned()
            .collect();
        *self.state.all_leases.write().await = leases;

        for lease in mine {
            self.state.acquire(lease, "adopted at startup").await?;
        }
        if *self.shutdown_tx.borrow() {
            // stopped while adopting, hand back what was picked up after the release
            self.state.release_all().await;
            return Err(WorkerError::ShuttingDown);
        }
        let held = self.state.held.read().await.len();
        info!(
            worker_id = %self.state.worker_id,
            held = held,
            "lease coordinator initialized"
        );
        Ok(())
    }

    /// Spawns the renewer, taker and rebalancer loops. Does nothing once
    /// the coordinator has been stopped.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        if *self.shutdown_tx.borrow() {
            debug!(worker_id = %self.state.worker_id, "lease coordinator already stopped, not starting");
            return;
        }
        info!(
            worker_id = %self.state.worker_id,
            renewal_interval_ms = self.state.config.renewal_interval().as_millis() as u64,
            taking_interval_ms = self.state.config.taking_interval().as_millis() as u64,
            rebalance_interval_ms = self.state.assignment.rebalance_interval_millis,
            "starting lease coordinator"
        );

        let state = self.state.clone();
        tasks.push(tokio::spawn(async move {
            let mut shutdown = state.shutdown.clone();
            let period = state.config.renewal_interval();
            while sleep_or_shutdown(period, &mut shutdown).await {
                state.renew_leases().await;
            }
        }));

        let state = self.state.clone();
        tasks.push(tokio::spawn(async move {
            let mut shutdown = state.shutdown.clone();
            let period = state.config.taking_interval();
            loop {
                if let Err(e) = state.take_leases().await {
                    warn!(worker_id = %state.worker_id, error = %e, "lease taking cycle failed, retrying next period");
                }
                if !sleep_or_shutdown(period, &mut shutdown).await {
                    break;
                }
            }
        }));

        let state = self.state.clone();
        tasks.push(tokio::spawn(async move {
            let mut shutdown = state.shutdown.clone();
            let period = state.assignment.rebalance_interval();
            while sleep_or_shutdown(period, &mut shutdown).await {
                if let Err(e) = state.rebalance().await {
                    warn!(worker_id = %state.worker_id, error = %e, "rebalancing pass failed, retrying next period");
                }
            }
        }));
    }

    /// Halts the background loops and releases held leases, best-effort.
    pub async fn stop(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.state.release_all().await;
        info!(worker_id = %self.state.worker_id, "lease coordinator stopped");
    }

    /// Snapshot of the shards this worker currently holds.
    pub async fn current_assignments(&self) -> Vec<ShardInfo> {
        let held = self.state.held.read().await;
        let mut shards: Vec<ShardInfo> = held
            .values()
            .map(|h| ShardInfo::from_lease(&h.lease, h.token))
            .collect();
        shards.sort_by(|a, b| a.lease_key.cmp(&b.lease_key));
        shards
    }

    /// Every lease seen at the last table scan.
    pub async fn all_leases_snapshot(&self) -> Vec<Lease> {
        self.state.all_leases.read().await.clone()
    }

    pub async fn is_leader(&self) -> bool {
        let live = self.state.live_workers.read().await.clone();
        self.state.leader.is_leader(&live)
    }

    /// Persists a new checkpoint for a held lease.
    ///
    /// The write is fenced on the held counter and on `token` still naming the
    /// current acquisition. Returns `false` when the lease is no longer held.
    pub async fn update_checkpoint(
        &self,
        lease_key: &str,
        token: ConcurrencyToken,
        checkpoint: Checkpoint,
    ) -> Result<bool> {
        let held = match self.state.held.read().await.get(lease_key) {
            Some(h) if h.token == token => h.clone(),
            _ => return Ok(false),
        };
        let mut proposal = held.lease.clone();
        proposal.checkpoint = checkpoint;
        proposal.owner_switches_since_checkpoint = 0;

        let mut shutdown = self.state.shutdown.clone();
        let outcome = self
            .state
            .retry
            .run("update_checkpoint", &mut shutdown, || {
                self.state
                    .store
                    .update_lease_conditional(proposal.clone(), held.lease.lease_counter)
            })
            .await?;
        Ok(self.state.apply_renewal(lease_key, token, outcome).await)
    }

    /// Runs one renewal cycle.
    pub async fn renew_leases(&self) {
        self.state.renew_leases().await
    }

    /// Runs one taking cycle.
    pub async fn take_leases(&self) -> Result<()> {
        self.state.take_leases().await
    }

    /// Runs one rebalancing pass if this worker is the leader, returning the
    /// number of leases moved.
    pub async fn rebalance(&self) -> Result<usize> {
        self.state.rebalance().await
    }
}

impl CoordinatorState {
    /// Conditionally writes `lease` with this worker as owner and starts
    /// holding it under a fresh concurrency token.
    pub(crate) async fn acquire(&self, lease: Lease, reason: &str) -> Result<bool> {
        let expected = lease.lease_counter;
        let proposal = lease.transferred_to(Some(&self.worker_id));
        let outcome = self
            .store
            .update_lease_conditional(proposal, expected)
            .await
            .map_err(WorkerError::from)?;
        match outcome {
            UpdateOutcome::Updated(stored) => {
                let token = ConcurrencyToken::new();
                info!(
                    worker_id = %self.worker_id,
                    lease_key = %stored.lease_key,
                    lease_counter = stored.lease_counter,
                    token = %token,
                    reason = reason,
                    "lease acquired"
                );
                let mut held = self.held.write().await;
                held.insert(
                    stored.lease_key.clone(),
                    HeldLease {
                        lease: stored,
                        token,
                        last_renewal: Instant::now(),
                    },
                );
                metrics::counter!(LEASES_TAKEN_TOTAL.name).increment(1);
                metrics::gauge!(LEASES_HELD.name).set(held.len() as f64);
                Ok(true)
            }
            UpdateOutcome::VersionConflict | UpdateOutcome::NotFound => {
                debug!(
                    worker_id = %self.worker_id,
                    lease_key = %lease.lease_key,
                    "lost race for lease, skipping this cycle"
                );
                Ok(false)
            }
        }
    }

    /// Records the counter of every lease, restarting the expiry clock of
    /// those whose counter moved.
    pub(crate) async fn observe(&self, leases: &[Lease]) {
        let now = Instant::now();
        let mut observed = self.observed.lock().await;
        observed.retain(|key, _| leases.iter().any(|l| &l.lease_key == key));
        for lease in leases {
            let entry = observed.entry(lease.lease_key.clone()).or_insert(Observation {
                counter: lease.lease_counter,
                since: now,
            });
            if entry.counter != lease.lease_counter {
                *entry = Observation {
                    counter: lease.lease_counter,
                    since: now,
                };
            }
        }
    }

    /// Workers considered alive: owners of unexpired leases, workers with
    /// fresh metric summaries, and this worker.
    pub(crate) async fn compute_live_workers(&self, leases: &[Lease]) -> BTreeSet<String> {
        let failover = self.config.failover_time();
        let mut live = BTreeSet::new();
        live.insert(self.worker_id.clone());
        {
            let observed = self.observed.lock().await;
            for lease in leases {
                let owner = match &lease.owner {
                    Some(owner) => owner,
                    None => continue,
                };
                let expired = observed
                    .get(&lease.lease_key)
                    .map(|o| o.since.elapsed() >= failover)
                    .unwrap_or(false);
                if !expired {
                    live.insert(owner.clone());
                }
            }
        }
        match self.metrics_store.list_worker_metrics().await {
            Ok(summaries) => {
                let now_ms = now_millis();
                let window = self.assignment.stale_worker_metrics_threshold();
                live.extend(
                    summaries
                        .into_iter()
                        .filter(|s| !s.is_stale(now_ms, window))
                        .map(|s| s.worker_id),
                );
            }
            Err(e) => {
                debug!(error = %e, "worker metrics unavailable, liveness from leases only");
            }
        }
        *self.live_workers.write().await = live.clone();
        live
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "lease_coordinator_test.rs"]
mod lease_coordinator_test;
