use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder — install once at
/// startup, then use the `metrics` crate's `counter!`/`gauge!` macros
/// anywhere. The `PrometheusHandle` is retained solely to render
/// `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and describe every metric
    /// this core emits. Must be called once, before any `counter!`/
    /// `gauge!` call — normally from `server::bootstrap::run`.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "admission_submitted_total",
            Unit::Count,
            "Total requests handed to Submit"
        );
        describe_counter!(
            "admission_admitted_total",
            Unit::Count,
            "Total requests admitted (directly or after queueing)"
        );
        describe_counter!(
            "admission_queued_total",
            Unit::Count,
            "Total requests that went onto a priority queue"
        );
        describe_counter!(
            "admission_rejected_total",
            Unit::Count,
            "Total requests rejected, labeled by reason"
        );
        describe_counter!(
            "admission_released_total",
            Unit::Count,
            "Total Release() calls that actually decremented in_flight"
        );
        describe_gauge!(
            "admission_in_flight",
            Unit::Count,
            "Requests currently admitted and not yet released"
        );
        describe_gauge!(
            "admission_queue_depth",
            Unit::Count,
            "Approximate queue depth, labeled by priority level"
        );
        describe_counter!(
            "admission_rule_applied_total",
            Unit::Count,
            "Total time-rule applications, labeled by rule name"
        );
        describe_gauge!(
            "admission_rule_active",
            Unit::Count,
            "1 if the named time rule is currently active, else 0"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
