use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Counters describing what a single node has been doing.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NodeMetrics {
    /// The number of key-value pairs stored locally on this node.
    pub local_key_count: u64,

    /// Lookups this node has answered, local or forwarded.
    pub lookups_served: u64,

    /// Sum of the hop counts of those lookups.
    pub total_lookup_hops: u64,

    /// Completed stabilize/fix_fingers/check_predecessor rounds.
    pub stabilization_rounds: u64,

    /// Rounds in which at least one step reported a failure.
    pub stabilization_errors: u64,

    /// Wall-clock time of the most recent round.
    #[serde(with = "humantime_serde")]
    pub last_round_duration: Duration,
}

impl NodeMetrics {
    pub fn record_lookup(&mut self, hops: u32) {
        self.lookups_served += 1;
        self.total_lookup_hops += u64::from(hops);
    }

    pub fn average_lookup_hops(&self) -> f64 {
        if self.lookups_served == 0 {
            return 0.0;
        }
        self.total_lookup_hops as f64 / self.lookups_served as f64
    }
}
