//! Unit Tests for the rebalancing decision step
//!
//! Each test builds a lease snapshot plus worker summaries and checks which
//! leases the planner proposes to move.

use super::*;
use shardlease_core::{Checkpoint, MetricType, OperatingRange};

const NOW_MS: u64 = 1_000_000;

fn lease(key: &str, owner: Option<&str>, kbps: Option<f64>) -> Lease {
    let mut lease = Lease::new(None, key, Checkpoint::TrimHorizon);
    lease.owner = owner.map(str::to_owned);
    lease.throughput_kbps = kbps;
    lease
}

fn summary(worker: &str, utilization: f64, last_update_ms: u64) -> WorkerMetricSummary {
    let mut summary = WorkerMetricSummary::new(worker);
    summary
        .metrics
        .entry(MetricType::Cpu)
        .or_default()
        .record(utilization, 1.0, 1);
    summary.last_update_ms = last_update_ms;
    summary
}

fn workers(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn moved_keys(plan: &RebalancePlan) -> Vec<&str> {
    plan.moves.iter().map(|m| m.lease.lease_key.as_str()).collect()
}

fn skewed_snapshot() -> Vec<Lease> {
    vec![
        lease("a", Some("w1"), Some(100.0)),
        lease("b", Some("w1"), Some(50.0)),
        lease("c", Some("w1"), Some(10.0)),
    ]
}

/// **Test:** Threshold gating and forced variance passes
///
/// **Expectation:** A 5 point gap with a 10 point threshold moves nothing on
/// regular passes, moves leases on every 3rd (forced) pass, and a 30 point
/// gap moves leases on a regular pass.
#[test]
fn test_threshold_and_forced_pass() {
    let config = AssignmentConfig::default();
    let leases = skewed_snapshot();
    let close = vec![summary("w1", 80.0, NOW_MS), summary("w2", 75.0, NOW_MS)];

    for pass in [1, 2, 4, 5] {
        let plan = plan_rebalance(&config, &leases, &close, &workers(&["w1", "w2"]), NOW_MS, pass);
        assert!(plan.is_empty(), "pass {pass} should not move leases");
        assert!((plan.utilization_gap - 5.0).abs() < 1e-9);
    }

    let forced = plan_rebalance(&config, &leases, &close, &workers(&["w1", "w2"]), NOW_MS, 3);
    assert!(forced.forced);
    assert!(!forced.is_empty());

    let wide = vec![summary("w1", 80.0, NOW_MS), summary("w2", 50.0, NOW_MS)];
    let plan = plan_rebalance(&config, &leases, &wide, &workers(&["w1", "w2"]), NOW_MS, 1);
    assert_eq!(plan.source.as_deref(), Some("w1"));
    assert_eq!(plan.target.as_deref(), Some("w2"));
    assert!(plan.moves.iter().all(|m| m.to_worker == "w2" && m.from_worker == "w1"));
    assert!(!plan.is_empty());
}

/// **Test:** Greedy selection, overshoot and per-host cap
///
/// **Expectation:** With overshoot allowed the heaviest lease is taken
/// because it narrows the gap; without overshoot the heaviest lease that
/// keeps the target under the mean is taken; a host cap skips leases that
/// would exceed it.
#[test]
fn test_greedy_selection_overshoot_and_cap() {
    let leases = skewed_snapshot();
    let summaries = vec![summary("w1", 80.0, NOW_MS), summary("w2", 20.0, NOW_MS)];
    let live = workers(&["w1", "w2"]);

    let overshoot = AssignmentConfig::default();
    let plan = plan_rebalance(&overshoot, &leases, &summaries, &live, NOW_MS, 1);
    assert_eq!(moved_keys(&plan), vec!["a"]);

    let no_overshoot = AssignmentConfig {
        allow_throughput_overshoot: false,
        ..Default::default()
    };
    let plan = plan_rebalance(&no_overshoot, &leases, &summaries, &live, NOW_MS, 1);
    assert_eq!(moved_keys(&plan), vec!["b"]);

    let capped = AssignmentConfig {
        max_throughput_per_host_kbps: 60.0,
        ..Default::default()
    };
    let plan = plan_rebalance(&capped, &leases, &summaries, &live, NOW_MS, 1);
    assert_eq!(moved_keys(&plan), vec!["b"]);
}

/// **Test:** Stale or missing metrics
///
/// **Expectation:** A worker with stale metrics never receives leases; when
/// it holds leases it is presumed saturated and becomes the source.
#[test]
fn test_stale_workers_are_sources_not_targets() {
    let config = AssignmentConfig::default();
    let stale_ms = NOW_MS - config.stale_worker_metrics_threshold_millis - 1;
    let leases = vec![
        lease("a", Some("w1"), Some(30.0)),
        lease("b", Some("w1"), Some(30.0)),
        lease("c", Some("w3"), Some(10.0)),
    ];
    let summaries = vec![
        summary("w1", 10.0, stale_ms),
        // w2 reports nothing at all
        summary("w3", 40.0, NOW_MS),
    ];
    let live = workers(&["w1", "w2", "w3"]);

    let plan = plan_rebalance(&config, &leases, &summaries, &live, NOW_MS, 1);
    assert_eq!(plan.source.as_deref(), Some("w1"));
    assert_eq!(plan.target.as_deref(), Some("w3"));
    assert!(!plan.is_empty());
    assert!(plan.moves.iter().all(|m| m.to_worker == "w3"));
}

/// **Test:** Count mode ignores throughput and summaries
///
/// **Expectation:** With metrics disabled the plan depends only on lease
/// counts: identical plans with or without throughput data, keys moved in
/// key order, and no move while counts differ by less than two.
#[test]
fn test_count_mode_ignores_throughput() {
    let config = AssignmentConfig {
        disable_worker_metrics: true,
        dampening_percentage: 100,
        ..Default::default()
    };
    let live = workers(&["w1", "w2"]);
    // summaries claim w1 is idle, count mode must not care
    let summaries = vec![summary("w1", 0.0, NOW_MS), summary("w2", 99.0, NOW_MS)];

    let with_throughput: Vec<Lease> = (0..6)
        .map(|i| lease(&format!("k{i}"), Some("w1"), Some(1000.0 - i as f64 * 100.0)))
        .collect();
    let without_throughput: Vec<Lease> = (0..6)
        .map(|i| lease(&format!("k{i}"), Some("w1"), None))
        .collect();

    let a = plan_rebalance(&config, &with_throughput, &summaries, &live, NOW_MS, 1);
    let b = plan_rebalance(&config, &without_throughput, &[], &live, NOW_MS, 1);
    assert_eq!(moved_keys(&a), vec!["k0", "k1", "k2"]);
    assert_eq!(moved_keys(&a), moved_keys(&b));
    assert_eq!(a.utilization_gap, b.utilization_gap);

    let nearly_even = vec![
        lease("k0", Some("w1"), None),
        lease("k1", Some("w1"), None),
        lease("k2", Some("w2"), None),
    ];
    let forced = plan_rebalance(&config, &nearly_even, &[], &live, NOW_MS, 3);
    assert!(forced.is_empty());
}

/// **Test:** Dampening in count mode
#[test]
fn test_count_mode_dampening_moves_at_least_one() {
    let config = AssignmentConfig {
        disable_worker_metrics: true,
        dampening_percentage: 10,
        ..Default::default()
    };
    let leases: Vec<Lease> = (0..4)
        .map(|i| lease(&format!("k{i}"), Some("w1"), None))
        .collect();
    let plan = plan_rebalance(&config, &leases, &[], &workers(&["w1", "w2"]), NOW_MS, 1);
    assert_eq!(moved_keys(&plan), vec!["k0"]);
}

/// **Test:** Deterministic tie breaking
///
/// **Expectation:** Equal utilization resolves to the smallest worker id for
/// the source and, among targets, the smallest remaining id.
#[test]
fn test_ties_broken_by_worker_id() {
    let config = AssignmentConfig::default();
    let leases = vec![
        lease("a", Some("w2"), Some(10.0)),
        lease("b", Some("w1"), Some(10.0)),
    ];
    let summaries = vec![
        summary("w1", 90.0, NOW_MS),
        summary("w2", 90.0, NOW_MS),
        summary("w3", 10.0, NOW_MS),
        summary("w4", 10.0, NOW_MS),
    ];
    let plan = plan_rebalance(
        &config,
        &leases,
        &summaries,
        &workers(&["w1", "w2", "w3", "w4"]),
        NOW_MS,
        1,
    );
    assert_eq!(plan.source.as_deref(), Some("w1"));
    assert_eq!(plan.target.as_deref(), Some("w3"));
}

/// **Test:** Missing throughput in metrics mode falls back to lease counts
#[test]
fn test_metrics_mode_without_throughput_moves_proportionally() {
    let config = AssignmentConfig {
        dampening_percentage: 100,
        ..Default::default()
    };
    let leases: Vec<Lease> = (0..4)
        .map(|i| lease(&format!("k{i}"), Some("w1"), None))
        .collect();
    let summaries = vec![summary("w1", 80.0, NOW_MS), summary("w2", 0.0, NOW_MS)];
    let plan = plan_rebalance(&config, &leases, &summaries, &workers(&["w1", "w2"]), NOW_MS, 1);
    // shift = 40 of 80 points, half of the 4 leases
    assert_eq!(moved_keys(&plan), vec!["k0", "k1"]);
}

/// **Test:** No target available
#[test]
fn test_single_worker_plans_nothing() {
    let config = AssignmentConfig::default();
    let leases = skewed_snapshot();
    let plan = plan_rebalance(
        &config,
        &leases,
        &[summary("w1", 99.0, NOW_MS)],
        &workers(&["w1"]),
        NOW_MS,
        3,
    );
    assert!(plan.is_empty());
    assert!(plan.target.is_none());
}

/// **Test:** Workers whose metrics have different operating ranges
///
/// **Expectation:** 40% CPU against a 50% range reads as 80 and is the
/// source; 60% against the default range reads as 60 and is the target.
#[test]
fn test_utilization_is_normalized_by_operating_range() {
    let config = AssignmentConfig::default();
    let leases = skewed_snapshot();
    let mut constrained = summary("w1", 40.0, NOW_MS);
    if let Some(cpu) = constrained.metrics.get_mut(&MetricType::Cpu) {
        cpu.operating_range = OperatingRange::new(50.0);
    }
    let summaries = vec![constrained, summary("w2", 60.0, NOW_MS)];

    let plan = plan_rebalance(&config, &leases, &summaries, &workers(&["w1", "w2"]), NOW_MS, 1);
    assert_eq!(plan.source.as_deref(), Some("w1"));
    assert_eq!(plan.target.as_deref(), Some("w2"));
    assert!((plan.utilization_gap - 20.0).abs() < 1e-9);
    assert!(!plan.is_empty());
}
