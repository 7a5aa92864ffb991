use futures::future::join_all;
use shardlease_core::UpdateOutcome;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CoordinatorState, HeldLease};
use crate::lease_metrics::{LEASES_HELD, LEASES_LOST_TOTAL, LEASE_RENEWAL_FAILURES_TOTAL};
use crate::shard_info::ConcurrencyToken;

impl CoordinatorState {
    /// Re-writes every held lease with an incremented counter.
    ///
    /// A conflict means another worker took the lease: it is dropped at once
    /// and not retried. Store failures are retried within the cycle; a lease
    /// that could not be renewed for a whole failover period is dropped too.
    pub(crate) async fn renew_leases(&self) {
        let held: Vec<HeldLease> = self.held.read().await.values().cloned().collect();
        let renewals = held.into_iter().map(|h| self.renew_one(h));
        join_all(renewals).await;
        metrics::gauge!(LEASES_HELD.name).set(self.held.read().await.len() as f64);
    }

    async fn renew_one(&self, held: HeldLease) {
        let key = held.lease.lease_key.clone();
        let mut shutdown = self.shutdown.clone();
        let result = self
            .retry
            .run("renew_lease", &mut shutdown, || {
                self.store
                    .update_lease_conditional(held.lease.clone(), held.lease.lease_counter)
            })
            .await;

        match result {
            Ok(outcome) => {
                self.apply_renewal(&key, held.token, outcome).await;
            }
            Err(e) => {
                metrics::counter!(LEASE_RENEWAL_FAILURES_TOTAL.name).increment(1);
                if held.last_renewal.elapsed() >= self.config.failover_time() {
                    warn!(
                        worker_id = %self.worker_id,
                        lease_key = %key,
                        error = %e,
                        "lease not renewed within failover time, dropping it"
                    );
                    self.drop_held(&key, held.token).await;
                } else {
                    warn!(
                        worker_id = %self.worker_id,
                        lease_key = %key,
                        error = %e,
                        "failed to renew lease, retrying next period"
                    );
                }
            }
        }
    }

    /// Applies the outcome of a fenced write on a held lease. Returns
    /// whether the lease is still held.
    pub(crate) async fn apply_renewal(
        &self,
        lease_key: &str,
        token: ConcurrencyToken,
        outcome: UpdateOutcome,
    ) -> bool {
        match outcome {
            UpdateOutcome::Updated(stored) => {
                let mut held = self.held.write().await;
                match held.get_mut(lease_key) {
                    Some(h) if h.token == token => {
                        debug!(
                            lease_key = %lease_key,
                            lease_counter = stored.lease_counter,
                            "lease renewed"
                        );
                        h.lease = stored;
                        h.last_renewal = Instant::now();
                        true
                    }
                    _ => false,
                }
            }
            UpdateOutcome::VersionConflict | UpdateOutcome::NotFound => {
                info!(
                    worker_id = %self.worker_id,
                    lease_key = %lease_key,
                    "lease lost to another worker"
                );
                metrics::counter!(LEASES_LOST_TOTAL.name).increment(1);
                self.drop_held(lease_key, token).await;
                false
            }
        }
    }

    pub(crate) async fn drop_held(&self, lease_key: &str, token: ConcurrencyToken) {
        let mut held = self.held.write().await;
        if held.get(lease_key).map(|h| h.token) == Some(token) {
            held.remove(lease_key);
        }
        metrics::gauge!(LEASES_HELD.name).set(held.len() as f64);
    }

    /// Clears the owner of every held lease, ignoring lost races and failures.
    pub(crate) async fn release_all(&self) {
        let held: Vec<HeldLease> = self.held.write().await.drain().map(|(_, h)| h).collect();
        let releases = held.into_iter().map(|h| async move {
            let mut released = h.lease.clone();
            released.owner = None;
            match self
                .store
                .update_lease_conditional(released, h.lease.lease_counter)
                .await
            {
                Ok(UpdateOutcome::Updated(_)) => {
                    debug!(lease_key = %h.lease.lease_key, "lease released")
                }
                Ok(_) => debug!(lease_key = %h.lease.lease_key, "lease changed before release"),
                Err(e) => warn!(
                    lease_key = %h.lease.lease_key,
                    error = %e,
                    "failed to release lease"
                ),
            }
        });
        join_all(releases).await;
        metrics::gauge!(LEASES_HELD.name).set(0.0);
    }
}
