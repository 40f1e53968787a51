//! Statistics surface: atomic scalars, not a mutex-protected struct.
//! Each counter is independently consistent; the snapshot as a whole
//! is not — counters are read one at a time, not under a shared lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    total_submitted: AtomicU64,
    total_admitted: AtomicU64,
    total_queued: AtomicU64,
    total_rejected: AtomicU64,
    total_expired: AtomicU64,
    delivery_dropped: AtomicU64,
    shutdown_timeout: AtomicU64,
    rule_conflicts: AtomicU64,
}

macro_rules! counter_methods {
    ($($field:ident => $inc_name:ident, $get_name:ident);* $(;)?) => {
        $(
            pub fn $inc_name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }

            pub fn $get_name(&self) -> u64 {
                self.$field.load(Ordering::Relaxed)
            }
        )*
    };
}

impl Stats {
    counter_methods! {
        total_submitted => incr_submitted, total_submitted;
        total_admitted => incr_admitted, total_admitted;
        total_queued => incr_queued, total_queued;
        total_rejected => incr_rejected, total_rejected;
        total_expired => incr_expired, total_expired;
        delivery_dropped => incr_delivery_dropped, delivery_dropped;
        shutdown_timeout => incr_shutdown_timeout, shutdown_timeout;
        rule_conflicts => incr_rule_conflicts, rule_conflicts;
    }

    /// Builds the `stats() -> map<string, u64>` surface, given the live
    /// pieces that aren't themselves atomics owned here.
    pub fn snapshot(&self, queue_depths: &[usize], in_flight: u64) -> HashMap<String, u64> {
        let mut map = HashMap::with_capacity(8 + queue_depths.len());
        map.insert("total_submitted".to_string(), self.total_submitted());
        map.insert("total_admitted".to_string(), self.total_admitted());
        map.insert("total_queued".to_string(), self.total_queued());
        map.insert("total_rejected".to_string(), self.total_rejected());
        map.insert("total_expired".to_string(), self.total_expired());
        map.insert("delivery_dropped".to_string(), self.delivery_dropped());
        map.insert("shutdown_timeout".to_string(), self.shutdown_timeout());
        map.insert("rule_conflicts".to_string(), self.rule_conflicts());
        map.insert("in_flight".to_string(), in_flight);
        for (i, depth) in queue_depths.iter().enumerate() {
            map.insert(format!("queue_depth_p{}", i), *depth as u64);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = Stats::default();
        stats.incr_submitted();
        stats.incr_submitted();
        stats.incr_admitted();
        assert_eq!(stats.total_submitted(), 2);
        assert_eq!(stats.total_admitted(), 1);
        assert_eq!(stats.total_rejected(), 0);
    }

    #[test]
    fn snapshot_includes_per_level_depth() {
        let stats = Stats::default();
        let snap = stats.snapshot(&[3, 0, 1], 7);
        assert_eq!(snap["queue_depth_p0"], 3);
        assert_eq!(snap["queue_depth_p1"], 0);
        assert_eq!(snap["queue_depth_p2"], 1);
        assert_eq!(snap["in_flight"], 7);
    }
}
