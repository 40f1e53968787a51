//! Prometheus metrics for the admission core: install once, then call
//! `metrics::counter!`/`gauge!` anywhere after. These free functions
//! are thin call-site wrappers so the rest of the crate never spells
//! out a metric name more than once.

mod registry;

pub use registry::Metrics;

pub fn admission_submitted() {
    metrics::counter!("admission_submitted_total").increment(1);
}

pub fn admission_admitted() {
    metrics::counter!("admission_admitted_total").increment(1);
}

pub fn admission_queued() {
    metrics::counter!("admission_queued_total").increment(1);
}

pub fn admission_rejected(reason: &'static str) {
    metrics::counter!("admission_rejected_total", "reason" => reason).increment(1);
}

pub fn admission_released() {
    metrics::counter!("admission_released_total").increment(1);
}

pub fn set_in_flight(value: u64) {
    metrics::gauge!("admission_in_flight").set(value as f64);
}

pub fn set_queue_depth(priority: usize, depth: usize) {
    metrics::gauge!("admission_queue_depth", "priority" => priority.to_string()).set(depth as f64);
}

pub fn rule_applied(name: &str) {
    metrics::counter!("admission_rule_applied_total", "rule" => name.to_string()).increment(1);
}

pub fn set_rule_active(name: &str, active: bool) {
    metrics::gauge!("admission_rule_active", "rule" => name.to_string())
        .set(if active { 1.0 } else { 0.0 });
}
