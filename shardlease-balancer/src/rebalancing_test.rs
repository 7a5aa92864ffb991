//! Unit Tests for move execution and history

use super::*;
use shardlease_core::{Checkpoint, MemoryLeaseStore, MetricType};

fn owned(key: &str, owner: &str) -> Lease {
    Lease::new(None, key, Checkpoint::TrimHorizon).with_owner(owner)
}

/// **Test:** Ring Buffer Behavior - FIFO with Capacity Limit
///
/// **Expectation:** With capacity=3, adding 5 records keeps the last 3,
/// most recent first.
#[test]
fn test_move_history_ring_buffer() {
    let mut history = MoveHistory::new(3);
    for i in 0..5 {
        history.record_move(MoveRecord {
            lease_key: format!("shard-{i}"),
            from_worker: "w1".into(),
            to_worker: "w2".into(),
            throughput_kbps: None,
            pass: i,
            timestamp: 0,
        });
    }
    assert_eq!(history.total_moves(), 3);
    let recent = history.recent_moves(10);
    assert_eq!(recent[0].lease_key, "shard-4");
    assert_eq!(recent[2].lease_key, "shard-2");

    history.clear();
    assert_eq!(history.total_moves(), 0);
}

/// **Test:** Moves fence on the snapshot counter
///
/// **Expectation:** A move whose lease was renewed after the snapshot loses
/// the race and is skipped; the other move is applied and counts an owner
/// switch.
#[tokio::test]
async fn test_execute_moves_skips_lost_races() {
    let store = MemoryLeaseStore::new();
    store.put_raw(owned("a", "w1"));
    store.put_raw(owned("b", "w1"));
    let snapshot = store.list_leases().await.unwrap();

    // w1 renews "b" after the snapshot was taken
    let renewed = snapshot[1].clone();
    store.update_lease_conditional(renewed, 0).await.unwrap();

    let moves = snapshot
        .into_iter()
        .map(|lease| LeaseMove {
            lease,
            from_worker: "w1".into(),
            to_worker: "w2".into(),
        })
        .collect();
    let applied = execute_moves(&store, moves).await;
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].lease.lease_key, "a");

    let a = store.get_lease("a").await.unwrap().unwrap();
    assert!(a.is_owned_by("w2"));
    assert_eq!(a.owner_switches_since_checkpoint, 1);
    let b = store.get_lease("b").await.unwrap().unwrap();
    assert!(b.is_owned_by("w1"));
}

/// **Test:** Engine pass counter drives forced passes and history
#[tokio::test]
async fn test_engine_run_pass_records_history() {
    let store = MemoryLeaseStore::new();
    for key in ["k0", "k1", "k2", "k3"] {
        store.put_raw(owned(key, "w1"));
    }
    let mut engine = AssignmentEngine::new(AssignmentConfig {
        disable_worker_metrics: true,
        dampening_percentage: 100,
        ..Default::default()
    });
    let live = vec!["w1".to_string(), "w2".to_string()];

    let leases = store.list_leases().await.unwrap();
    let applied = engine.run_pass(&store, &leases, &[], &live, 0).await;
    assert_eq!(applied, 2);
    assert_eq!(engine.passes(), 1);
    assert_eq!(engine.history().total_moves(), 2);

    // balanced now, nothing more to do even on a forced pass
    for _ in 0..3 {
        let leases = store.list_leases().await.unwrap();
        assert_eq!(engine.run_pass(&store, &leases, &[], &live, 0).await, 0);
    }
    assert_eq!(engine.passes(), 4);

    let owners: Vec<_> = store
        .list_leases()
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.owner.unwrap())
        .collect();
    assert_eq!(owners, vec!["w2", "w2", "w1", "w1"]);
}

/// **Test:** Metrics mode end to end against the store
#[tokio::test]
async fn test_engine_moves_towards_idle_worker() {
    let store = MemoryLeaseStore::new();
    store.put_raw(owned("a", "w1").with_throughput(60.0));
    store.put_raw(owned("b", "w1").with_throughput(40.0));
    let mut idle = WorkerMetricSummary::new("w2");
    idle.metrics.entry(MetricType::Cpu).or_default().record(5.0, 1.0, 1);
    idle.last_update_ms = 10;
    let mut busy = WorkerMetricSummary::new("w1");
    busy.metrics.entry(MetricType::Cpu).or_default().record(90.0, 1.0, 1);
    busy.last_update_ms = 10;

    let mut engine = AssignmentEngine::new(AssignmentConfig::default());
    let leases = store.list_leases().await.unwrap();
    let applied = engine
        .run_pass(
            &store,
            &leases,
            &[busy, idle],
            &["w1".to_string(), "w2".to_string()],
            20,
        )
        .await;
    assert_eq!(applied, 1);
    let moved = engine.history().recent_moves(1)[0];
    assert_eq!(moved.to_worker, "w2");
}
