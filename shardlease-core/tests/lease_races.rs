//! Conditional-write races between simulated workers on one lease key.

use futures::future::join_all;
use shardlease_core::{Checkpoint, Lease, LeaseStore, MemoryLeaseStore, UpdateOutcome};
use std::collections::HashSet;

/// **Test:** Racing takeovers on a single lease
///
/// **Expectation:** For every counter value at most one of N racing workers
/// succeeds, and the stored counter strictly increases with each round.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_writer_wins_per_counter_value() {
    let store = MemoryLeaseStore::new();
    store
        .create_lease_if_absent(Lease::new(None, "shard-0", Checkpoint::TrimHorizon))
        .await
        .unwrap();

    let mut last_counter = 0;
    for _round in 0..20 {
        let snapshot = store.get_lease("shard-0").await.unwrap().unwrap();
        let expected = snapshot.lease_counter;

        let attempts = (0..8).map(|w| {
            let store = store.clone();
            let proposal = snapshot.transferred_to(Some(&format!("worker-{w}")));
            tokio::spawn(async move { store.update_lease_conditional(proposal, expected).await })
        });
        let outcomes: Vec<UpdateOutcome> = join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let winners: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                UpdateOutcome::Updated(lease) => Some(lease.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1, "exactly one writer wins each round");
        assert!(winners[0].lease_counter > last_counter);
        last_counter = winners[0].lease_counter;

        let counters: HashSet<_> = winners.iter().map(|l| l.lease_counter).collect();
        assert_eq!(counters.len(), winners.len());
    }
    assert_eq!(last_counter, 20);
}
