pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
}

pub const COUNTERS: [Metric; 2] = [REBALANCE_MOVES_TOTAL, REBALANCE_MOVE_CONFLICTS_TOTAL];
pub const GAUGES: [Metric; 2] = [WORKER_UTILIZATION, UTILIZATION_GAP];
pub const HISTOGRAMS: [Metric; 1] = [REBALANCE_PASS_DURATION_SECONDS];

pub(crate) const REBALANCE_MOVES_TOTAL: Metric = Metric {
    name: "shardlease_rebalance_moves_total",
    description: "Total number of lease ownership moves applied by the assignment engine",
};

pub(crate) const REBALANCE_MOVE_CONFLICTS_TOTAL: Metric = Metric {
    name: "shardlease_rebalance_move_conflicts_total",
    description: "Total number of proposed moves that lost a conditional-write race",
};

pub(crate) const WORKER_UTILIZATION: Metric = Metric {
    name: "shardlease_worker_utilization",
    description: "Smoothed utilization of this worker per metric type (percent)",
};

pub(crate) const UTILIZATION_GAP: Metric = Metric {
    name: "shardlease_utilization_gap",
    description: "Utilization gap between the most and least loaded workers at the last pass",
};

pub(crate) const REBALANCE_PASS_DURATION_SECONDS: Metric = Metric {
    name: "shardlease_rebalance_pass_duration_seconds",
    description: "Duration of a rebalancing pass including move execution",
};
