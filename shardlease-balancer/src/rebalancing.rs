use serde::Serialize;
use shardlease_core::{Lease, LeaseStore, UpdateOutcome, WorkerMetricSummary};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::aggregator::now_millis;
use crate::assignment::{plan_rebalance, LeaseMove, RebalancePlan};
use crate::balancer_metrics::{
    REBALANCE_MOVES_TOTAL, REBALANCE_MOVE_CONFLICTS_TOTAL, REBALANCE_PASS_DURATION_SECONDS,
    UTILIZATION_GAP,
};
use crate::config::AssignmentConfig;

/// An applied ownership move
#[derive(Debug, Clone, Serialize)]
pub struct MoveRecord {
    pub lease_key: String,
    pub from_worker: String,
    pub to_worker: String,
    pub throughput_kbps: Option<f64>,
    pub pass: u64,
    /// Unix milliseconds
    pub timestamp: u64,
}

/// Ring buffer of recent applied moves, for inspection and audit
#[derive(Debug)]
pub struct MoveHistory {
    moves: VecDeque<MoveRecord>,
    max_size: usize,
}

impl MoveHistory {
    pub fn new(max_size: usize) -> Self {
        Self {
            moves: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn record_move(&mut self, mv: MoveRecord) {
        if self.max_size == 0 {
            return;
        }
        if self.moves.len() >= self.max_size {
            self.moves.pop_front();
        }
        self.moves.push_back(mv);
    }

    /// Most recent first
    pub fn recent_moves(&self, limit: usize) -> Vec<&MoveRecord> {
        self.moves.iter().rev().take(limit).collect()
    }

    pub fn total_moves(&self) -> usize {
        self.moves.len()
    }

    pub fn clear(&mut self) {
        self.moves.clear();
    }
}

/// Applies each move as one conditional write against the snapshot counter.
///
/// A lost race or a vanished lease is expected and simply skipped, store
/// failures are logged; the pass never waits for another attempt. Returns
/// the moves that were applied.
pub async fn execute_moves(store: &dyn LeaseStore, moves: Vec<LeaseMove>) -> Vec<LeaseMove> {
    let mut applied = Vec::with_capacity(moves.len());
    for mv in moves {
        let proposal: Lease = mv.lease.transferred_to(Some(&mv.to_worker));
        match store
            .update_lease_conditional(proposal, mv.lease.lease_counter)
            .await
        {
            Ok(UpdateOutcome::Updated(_)) => {
                info!(
                    lease_key = %mv.lease.lease_key,
                    from = %mv.from_worker,
                    to = %mv.to_worker,
                    throughput_kbps = ?mv.lease.throughput_kbps,
                    "lease reassigned"
                );
                metrics::counter!(REBALANCE_MOVES_TOTAL.name).increment(1);
                applied.push(mv);
            }
            Ok(UpdateOutcome::VersionConflict) | Ok(UpdateOutcome::NotFound) => {
                debug!(
                    lease_key = %mv.lease.lease_key,
                    "lease changed since snapshot, skipping move"
                );
                metrics::counter!(REBALANCE_MOVE_CONFLICTS_TOTAL.name).increment(1);
            }
            Err(e) => {
                warn!(
                    lease_key = %mv.lease.lease_key,
                    error = %e,
                    "failed to reassign lease, retrying next pass"
                );
            }
        }
    }
    applied
}

/// Stateful wrapper running one rebalancing pass at a time
#[derive(Debug)]
pub struct AssignmentEngine {
    config: AssignmentConfig,
    passes: u64,
    history: MoveHistory,
}

impl AssignmentEngine {
    pub fn new(config: AssignmentConfig) -> Self {
        Self {
            config,
            passes: 0,
            history: MoveHistory::new(1000),
        }
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn history(&self) -> &MoveHistory {
        &self.history
    }

    /// Decides the next pass without touching the store.
    pub fn plan(
        &mut self,
        leases: &[Lease],
        summaries: &[WorkerMetricSummary],
        live_workers: &[String],
        now_ms: u64,
    ) -> RebalancePlan {
        self.passes += 1;
        let plan = plan_rebalance(
            &self.config,
            leases,
            summaries,
            live_workers,
            now_ms,
            self.passes,
        );
        metrics::gauge!(UTILIZATION_GAP.name).set(plan.utilization_gap);
        plan
    }

    /// Plans and executes one pass, returning the number of applied moves.
    pub async fn run_pass(
        &mut self,
        store: &dyn LeaseStore,
        leases: &[Lease],
        summaries: &[WorkerMetricSummary],
        live_workers: &[String],
        now_ms: u64,
    ) -> usize {
        let started = Instant::now();
        let plan = self.plan(leases, summaries, live_workers, now_ms);
        if plan.is_empty() {
            return 0;
        }

        info!(
            pass = self.passes,
            source = ?plan.source,
            target = ?plan.target,
            gap = plan.utilization_gap,
            forced = plan.forced,
            proposed = plan.moves.len(),
            "rebalancing leases"
        );

        let applied = execute_moves(store, plan.moves).await;
        let timestamp = now_millis();
        for mv in &applied {
            self.history.record_move(MoveRecord {
                lease_key: mv.lease.lease_key.clone(),
                from_worker: mv.from_worker.clone(),
                to_worker: mv.to_worker.clone(),
                throughput_kbps: mv.lease.throughput_kbps,
                pass: self.passes,
                timestamp,
            });
        }
        metrics::histogram!(REBALANCE_PASS_DURATION_SECONDS.name)
            .record(started.elapsed().as_secs_f64());
        applied.len()
    }
}

#[cfg(test)]
#[path = "rebalancing_test.rs"]
mod rebalancing_test;
