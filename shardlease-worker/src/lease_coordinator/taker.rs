use shardlease_core::Lease;
use tracing::{debug, info};

use super::{now_millis, CoordinatorState};
use crate::errors::Result;

impl CoordinatorState {
    /// One taking cycle.
    ///
    /// Adopts leases that name this worker as owner but are not held yet
    /// (assigned by a rebalancing pass), then claims unowned and expired
    /// leases until this worker holds its fair share
    /// `ceil(total leases / live workers)`. Expired claims are limited to
    /// `max_leases_to_steal_at_once` per cycle.
    pub(crate) async fn take_leases(&self) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        let leases = self
            .retry
            .run("list_leases", &mut shutdown, || self.store.list_leases())
            .await?;

        self.observe(&leases).await;
        *self.all_leases.write().await = leases.clone();
        let live = self.compute_live_workers(&leases).await;

        let held_keys: Vec<String> = self.held.read().await.keys().cloned().collect();
        let is_held = |lease: &Lease| held_keys.iter().any(|k| k == &lease.lease_key);

        for lease in leases
            .iter()
            .filter(|l| l.is_owned_by(&self.worker_id) && !is_held(*l))
        {
            self.acquire(lease.clone(), "assigned to this worker").await?;
        }

        let held_count = self.held.read().await.len();
        let fair_share = leases.len().div_ceil(live.len().max(1));
        let target = match self.config.max_leases_for_worker {
            Some(max) => fair_share.min(max),
            None => fair_share,
        };
        let mut capacity = target.saturating_sub(held_count);
        if capacity == 0 {
            return Ok(());
        }

        let failover = self.config.failover_time();
        let expired: Vec<&Lease> = {
            let observed = self.observed.lock().await;
            leases
                .iter()
                .filter(|l| l.owner.is_some() && !l.is_owned_by(&self.worker_id))
                .filter(|l| {
                    observed
                        .get(&l.lease_key)
                        .map(|o| o.since.elapsed() >= failover)
                        .unwrap_or(false)
                })
                .collect()
        };
        let unowned = leases.iter().filter(|l| l.is_unowned() && !is_held(*l));

        debug!(
            worker_id = %self.worker_id,
            live_workers = live.len(),
            fair_share = fair_share,
            held = held_count,
            expired = expired.len(),
            "evaluating leases to take"
        );

        for lease in unowned {
            if capacity == 0 {
                break;
            }
            if self.acquire(lease.clone(), "unowned").await? {
                capacity -= 1;
            }
        }

        let mut stolen = 0;
        for lease in expired {
            if capacity == 0 || stolen >= self.config.max_leases_to_steal_at_once {
                break;
            }
            info!(
                worker_id = %self.worker_id,
                lease_key = %lease.lease_key,
                previous_owner = ?lease.owner,
                "taking expired lease"
            );
            if self.acquire(lease.clone(), "expired").await? {
                capacity -= 1;
                stolen += 1;
            }
        }
        Ok(())
    }

    /// Runs one assignment pass when this worker is the leader.
    pub(crate) async fn rebalance(&self) -> Result<usize> {
        let leases = self.all_leases.read().await.clone();
        let live = self.compute_live_workers(&leases).await;
        if !self.leader.is_leader(&live) {
            return Ok(0);
        }

        let mut shutdown = self.shutdown.clone();
        let leases = self
            .retry
            .run("list_leases", &mut shutdown, || self.store.list_leases())
            .await?;
        let summaries = if self.assignment.disable_worker_metrics {
            Vec::new()
        } else {
            self.retry
                .run("list_worker_metrics", &mut shutdown, || {
                    self.metrics_store.list_worker_metrics()
                })
                .await?
        };
        let live: Vec<String> = live.into_iter().collect();

        let mut engine = self.engine.lock().await;
        let moved = engine
            .run_pass(self.store.as_ref(), &leases, &summaries, &live, now_millis())
            .await;
        Ok(moved)
    }
}
