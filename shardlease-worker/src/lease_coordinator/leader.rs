use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::lease_metrics::LEADER_STATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Leading,
    Following,
}

/// Deterministic leader choice among live workers.
///
/// Every worker computes the same answer from the same view of the lease
/// table: the lexicographically smallest live worker id leads. Views may
/// briefly disagree; a duplicate leader only causes duplicate conditional
/// writes, which the lease counter fences.
#[derive(Debug, Clone)]
pub struct LeaderDecider {
    worker_id: String,
    leading: Arc<AtomicBool>,
}

impl LeaderDecider {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            leading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn leader_of<'a>(&'a self, live_workers: &'a BTreeSet<String>) -> &'a str {
        match live_workers.iter().next() {
            Some(first) if first.as_str() < self.worker_id.as_str() => first,
            _ => &self.worker_id,
        }
    }

    pub fn is_leader(&self, live_workers: &BTreeSet<String>) -> bool {
        let leading = self.leader_of(live_workers) == self.worker_id;
        let was_leading = self.leading.swap(leading, Ordering::SeqCst);
        if was_leading != leading {
            info!(worker_id = %self.worker_id, leading = leading, "leader state changed");
            metrics::gauge!(LEADER_STATE.name).set(if leading { 1.0 } else { 0.0 });
        }
        leading
    }

    pub fn state(&self) -> LeaderState {
        if self.leading.load(Ordering::SeqCst) {
            LeaderState::Leading
        } else {
            LeaderState::Following
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn smallest_live_id_leads() {
        let a = LeaderDecider::new("worker-a");
        let b = LeaderDecider::new("worker-b");
        let live = set(&["worker-a", "worker-b", "worker-c"]);

        assert!(a.is_leader(&live));
        assert!(!b.is_leader(&live));
        assert_eq!(a.state(), LeaderState::Leading);
        assert_eq!(b.state(), LeaderState::Following);

        // worker-a disappears
        assert!(b.is_leader(&set(&["worker-b", "worker-c"])));
    }

    #[test]
    fn self_counts_as_live() {
        let z = LeaderDecider::new("worker-z");
        assert!(z.is_leader(&BTreeSet::new()));
        assert_eq!(z.leader_of(&set(&["worker-y"])), "worker-y");
    }
}
