use serde::Serialize;
use shardlease_core::{Lease, WorkerMetricSummary, MAX_UTILIZATION};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

use crate::config::AssignmentConfig;

/// Load view of one worker during a rebalancing pass
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLoad {
    pub worker_id: String,
    /// Lease keys owned by the worker, in key order
    pub lease_keys: Vec<String>,
    /// Sum of the throughput of owned leases (KBps), missing values count as 0
    pub throughput_kbps: f64,
    /// Utilization in percent, see `plan_rebalance`
    pub utilization: f64,
    /// Whether the worker may receive leases
    pub eligible_target: bool,
}

impl WorkerLoad {
    pub fn lease_count(&self) -> usize {
        self.lease_keys.len()
    }
}

/// A single proposed ownership change
#[derive(Debug, Clone)]
pub struct LeaseMove {
    /// Lease as observed in the snapshot; its counter fences the write
    pub lease: Lease,
    pub from_worker: String,
    pub to_worker: String,
}

/// Outcome of the decision step of a pass
#[derive(Debug, Clone, Default)]
pub struct RebalancePlan {
    pub moves: Vec<LeaseMove>,
    pub source: Option<String>,
    pub target: Option<String>,
    pub utilization_gap: f64,
    pub forced: bool,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Decides which leases should change hands in pass number `pass`.
///
/// Utilization per worker:
/// - metrics mode: the smoothed bottleneck utilization of a fresh summary.
///   Workers without a fresh summary are never targets and are presumed
///   saturated, so they may still shed leases.
/// - count mode (`disable_worker_metrics`): lease count as a percentage of
///   the fair share `ceil(owned leases / workers)`. Throughput and summaries
///   are not read.
///
/// The source is the most utilized worker holding a lease and the target the
/// least utilized eligible worker, ties broken by worker id. Nothing moves
/// while their gap is below `rebalance_threshold_percentage`, unless `pass`
/// is a forced variance-balancing pass.
pub fn plan_rebalance(
    config: &AssignmentConfig,
    leases: &[Lease],
    summaries: &[WorkerMetricSummary],
    live_workers: &[String],
    now_ms: u64,
    pass: u64,
) -> RebalancePlan {
    let forced = config.is_forced_pass(pass);
    let loads = compute_worker_loads(config, leases, summaries, live_workers, now_ms);

    let mut plan = RebalancePlan {
        forced,
        ..Default::default()
    };

    let source = match loads
        .values()
        .filter(|w| w.lease_count() > 0)
        .min_by(|a, b| by_utilization_desc(a, b))
    {
        Some(source) => source,
        None => return plan,
    };
    let target = match loads
        .values()
        .filter(|w| w.eligible_target && w.worker_id != source.worker_id)
        .min_by(|a, b| by_utilization_asc(a, b))
    {
        Some(target) => target,
        None => return plan,
    };

    let gap = source.utilization - target.utilization;
    plan.source = Some(source.worker_id.clone());
    plan.target = Some(target.worker_id.clone());
    plan.utilization_gap = gap;

    if gap <= 0.0 || (gap < config.rebalance_threshold_percentage && !forced) {
        trace!(
            source = %source.worker_id,
            target = %target.worker_id,
            gap = gap,
            forced = forced,
            "utilization gap below rebalance threshold"
        );
        return plan;
    }

    let by_key: BTreeMap<&str, &Lease> = leases.iter().map(|l| (l.lease_key.as_str(), l)).collect();
    let source_leases: Vec<&Lease> = source
        .lease_keys
        .iter()
        .filter_map(|k| by_key.get(k.as_str()).copied())
        .collect();

    let selected = if config.disable_worker_metrics {
        select_by_count(config, source, target, source_leases)
    } else {
        let mean_load =
            loads.values().map(|w| w.throughput_kbps).sum::<f64>() / loads.len() as f64;
        select_by_throughput(config, source, target, gap, mean_load, source_leases)
    };

    debug!(
        source = %source.worker_id,
        target = %target.worker_id,
        gap = gap,
        forced = forced,
        selected = selected.len(),
        "rebalancing pass selected leases"
    );

    plan.moves = selected
        .into_iter()
        .map(|lease| LeaseMove {
            lease: lease.clone(),
            from_worker: source.worker_id.clone(),
            to_worker: target.worker_id.clone(),
        })
        .collect();
    plan
}

/// Builds the per-worker load view, keyed by worker id.
pub(crate) fn compute_worker_loads(
    config: &AssignmentConfig,
    leases: &[Lease],
    summaries: &[WorkerMetricSummary],
    live_workers: &[String],
    now_ms: u64,
) -> BTreeMap<String, WorkerLoad> {
    let mut workers: BTreeSet<String> = live_workers.iter().cloned().collect();
    workers.extend(leases.iter().filter_map(|l| l.owner.clone()));

    let mut loads: BTreeMap<String, WorkerLoad> = workers
        .into_iter()
        .map(|id| {
            (
                id.clone(),
                WorkerLoad {
                    worker_id: id,
                    lease_keys: Vec::new(),
                    throughput_kbps: 0.0,
                    utilization: 0.0,
                    eligible_target: true,
                },
            )
        })
        .collect();

    let mut owned: Vec<&Lease> = leases.iter().filter(|l| l.owner.is_some()).collect();
    owned.sort_by(|a, b| a.lease_key.cmp(&b.lease_key));
    for lease in &owned {
        if let Some(load) = lease.owner.as_ref().and_then(|o| loads.get_mut(o)) {
            load.lease_keys.push(lease.lease_key.clone());
            if !config.disable_worker_metrics {
                load.throughput_kbps += lease.throughput_kbps.unwrap_or(0.0);
            }
        }
    }

    if config.disable_worker_metrics {
        let fair_share = owned.len().div_ceil(loads.len().max(1)).max(1) as f64;
        for load in loads.values_mut() {
            load.utilization = load.lease_count() as f64 / fair_share * 100.0;
        }
        return loads;
    }

    let stale_window = config.stale_worker_metrics_threshold();
    for load in loads.values_mut() {
        let fresh = summaries
            .iter()
            .find(|s| s.worker_id == load.worker_id)
            .filter(|s| !s.is_stale(now_ms, stale_window))
            .and_then(|s| s.utilization());
        match fresh {
            Some(utilization) => load.utilization = utilization,
            None => {
                load.utilization = MAX_UTILIZATION;
                load.eligible_target = false;
            }
        }
    }
    loads
}

/// Count mode: halve the count difference, dampened, in lease key order.
fn select_by_count<'a>(
    config: &AssignmentConfig,
    source: &WorkerLoad,
    target: &WorkerLoad,
    source_leases: Vec<&'a Lease>,
) -> Vec<&'a Lease> {
    let diff = source.lease_count().saturating_sub(target.lease_count());
    if diff < 2 {
        return Vec::new();
    }
    let dampened = (diff as f64 / 2.0 * config.dampening_percentage as f64 / 100.0).floor();
    let n = (dampened as usize).max(1);
    source_leases.into_iter().take(n).collect()
}

/// Metrics mode: greedy by descending throughput until the dampened shift is covered.
fn select_by_throughput<'a>(
    config: &AssignmentConfig,
    source: &WorkerLoad,
    target: &WorkerLoad,
    gap: f64,
    mean_load: f64,
    mut source_leases: Vec<&'a Lease>,
) -> Vec<&'a Lease> {
    let shift = gap / 2.0 * config.dampening_percentage as f64 / 100.0;
    if shift <= 0.0 {
        return Vec::new();
    }

    if source.throughput_kbps <= 0.0 || source.utilization <= 0.0 {
        // no throughput data, move a proportional number of leases
        let n = (source.lease_count() as f64 * shift / source.utilization.max(1.0)).round() as usize;
        let n = n.clamp(1, source.lease_count());
        return source_leases.into_iter().take(n).collect();
    }

    let budget_kbps = shift * source.throughput_kbps / source.utilization;
    let cap = config.max_throughput_per_host_kbps;

    source_leases.sort_by(|a, b| {
        let ta = a.throughput_kbps.unwrap_or(0.0);
        let tb = b.throughput_kbps.unwrap_or(0.0);
        tb.partial_cmp(&ta)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.lease_key.cmp(&b.lease_key))
    });

    let mut source_load = source.throughput_kbps;
    let mut target_load = target.throughput_kbps;
    let mut moved = 0.0;
    let mut selected = Vec::new();

    for lease in source_leases {
        if moved >= budget_kbps {
            break;
        }
        let kbps = lease.throughput_kbps.unwrap_or(0.0);
        if kbps <= 0.0 {
            continue;
        }
        if cap > 0.0 && target_load + kbps > cap {
            trace!(lease_key = %lease.lease_key, "move would exceed per-host throughput cap");
            continue;
        }
        let projected_target = target_load + kbps;
        if projected_target > mean_load {
            let current_gap = (source_load - target_load).abs();
            let projected_gap = ((source_load - kbps) - projected_target).abs();
            if !config.allow_throughput_overshoot || projected_gap >= current_gap {
                trace!(lease_key = %lease.lease_key, "move would overshoot the fleet mean");
                continue;
            }
        }
        source_load -= kbps;
        target_load = projected_target;
        moved += kbps;
        selected.push(lease);
    }
    selected
}

fn by_utilization_desc(a: &WorkerLoad, b: &WorkerLoad) -> Ordering {
    b.utilization
        .partial_cmp(&a.utilization)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.worker_id.cmp(&b.worker_id))
}

fn by_utilization_asc(a: &WorkerLoad, b: &WorkerLoad) -> Ordering {
    a.utilization
        .partial_cmp(&b.utilization)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.worker_id.cmp(&b.worker_id))
}

#[cfg(test)]
#[path = "assignment_test.rs"]
mod assignment_test;
