//! Admission control and priority scheduling core for an LLM gateway.
//!
//! Wires five components into one handle:
//!
//! - `queue` (C1) — per-priority bounded FIFOs for waiting requests.
//! - `capacity` (C2) — single-owner global concurrency/RPS/tokens-per-sec.
//! - `quota` (C3) — same, per matched account-tag pattern.
//! - `scheduler` (C4) — ticks the queue bank against C2/C3.
//! - `rules` (C5) — time-windowed reconfiguration of weights/quotas/capacity.
//!
//! [`AdmissionCore`] is the programmatic surface: `submit`, `release`,
//! `stats`, `set_policy`, and the admin-facing rule engine handle.

pub mod capacity;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod queue;
pub mod quota;
pub mod request;
pub mod rules;
pub mod scheduler;
pub mod server;
pub mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::Notify;

use capacity::CapacityManager;
use config::CoreConfig;
use error::{CoreError, RejectReason, SubmitError};
use queue::{EnqueueOutcome, PriorityQueueBank};
use quota::QuotaManager;
use request::{Request, RequestId, ScheduleResult};
use rules::RuleEngineHandle;
use scheduler::{InFlightRegistry, Policy, SchedulerLoop};
use stats::Stats;

pub use request::{RequestBuilder, ResultReceiver};

/// Handle to the full admission & scheduling core, cheaply cloneable —
/// every field is either an `Arc`, an actor handle over a channel, or
/// both: a small `Clone` aggregate over sub-state actors rather than a
/// single mutex.
#[derive(Clone)]
pub struct AdmissionCore {
    queue: Arc<PriorityQueueBank>,
    capacity: CapacityManager,
    quota: QuotaManager,
    policy: Arc<ArcSwap<Policy>>,
    weights: Arc<ArcSwap<Vec<u32>>>,
    stats: Arc<Stats>,
    in_flight: InFlightRegistry,
    rule_engine: RuleEngineHandle,
    shutdown: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
    num_priority_levels: usize,
}

impl AdmissionCore {
    /// Validate `config`, spawn C2/C3/C4/C5's owning tasks, and return a
    /// handle. Panics never occur here — every failure mode (bad config,
    /// unparseable time rule) surfaces as `CoreError`.
    pub fn new(config: CoreConfig) -> Result<Self, CoreError> {
        config
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let queue = Arc::new(PriorityQueueBank::new(
            config.num_priority_levels,
            config.max_queue_depth,
        ));
        let capacity = CapacityManager::spawn(config.capacity);
        let quota = QuotaManager::spawn(config.quotas.clone());

        let weights_baseline = config.resolved_weights();
        let weights = Arc::new(ArcSwap::from_pointee(weights_baseline.clone()));
        let policy = Arc::new(ArcSwap::from_pointee(config.policy));
        let stats = Arc::new(Stats::default());
        let in_flight: InFlightRegistry = Arc::new(DashMap::new());
        let shutdown = Arc::new(Notify::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let rule_engine = RuleEngineHandle::spawn(
            config.time_rules.clone(),
            weights.clone(),
            weights_baseline,
            capacity.clone(),
            config.capacity,
            quota.clone(),
            config.quotas.clone(),
            stats.clone(),
        )
        .map_err(|e| CoreError::Config(e.to_string()))?;

        SchedulerLoop::new(
            queue.clone(),
            capacity.clone(),
            quota.clone(),
            policy.clone(),
            weights.clone(),
            stats.clone(),
            in_flight.clone(),
            config.scheduler_tick(),
            shutdown.clone(),
            shutting_down.clone(),
        )
        .spawn();

        Ok(Self {
            queue,
            capacity,
            quota,
            policy,
            weights,
            stats,
            in_flight,
            rule_engine,
            shutdown,
            shutting_down,
            num_priority_levels: config.num_priority_levels,
        })
    }

    /// Submits a request for admission. The request's own `result_sink`
    /// carries the eventual `ScheduleResult`; this return value only
    /// surfaces the synchronous failure modes (shutdown in progress,
    /// invalid priority, queue full).
    pub async fn submit(&self, req: Request) -> Result<(), SubmitError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            tracing::debug!(request_id = %req.id, "submit: rejected, shutting_down");
            self.stats.incr_rejected();
            metrics::admission_rejected("shutting_down");
            return Err(SubmitError::ShuttingDown);
        }
        if req.priority >= self.num_priority_levels {
            tracing::debug!(
                request_id = %req.id,
                priority = req.priority,
                "submit: rejected, invalid_priority"
            );
            self.stats.incr_rejected();
            metrics::admission_rejected("invalid_priority");
            return Err(SubmitError::InvalidPriority);
        }

        self.stats.incr_submitted();
        metrics::admission_submitted();

        match scheduler::try_admit(&self.capacity, &self.quota, &req).await {
            Ok(()) => {
                self.in_flight.insert(req.id, req.account_tag.clone());
                self.stats.incr_admitted();
                metrics::admission_admitted();
                metrics::set_in_flight(self.in_flight.len() as u64);
                let wait = req.submitted_at.elapsed();
                tracing::debug!(request_id = %req.id, priority = req.priority, "submit: admitted");
                if !req.deliver(ScheduleResult::admitted(wait)) {
                    self.stats.incr_delivery_dropped();
                }
                Ok(())
            }
            Err(reason) => {
                tracing::debug!(
                    request_id = %req.id,
                    priority = req.priority,
                    reason = reason.as_str(),
                    "submit: not admitted, queueing"
                );
                let priority = req.priority;
                match self.queue.try_enqueue(priority, req) {
                    EnqueueOutcome::Ok => {
                        self.stats.incr_queued();
                        metrics::admission_queued();
                        Ok(())
                    }
                    EnqueueOutcome::QueueFull => {
                        self.stats.incr_rejected();
                        metrics::admission_rejected("queue_full");
                        Err(SubmitError::QueueFull)
                    }
                }
            }
        }
    }

    /// Releases an in-flight request. Idempotent — a second call on an
    /// id no longer tracked in `in_flight` (already released, or never
    /// admitted) is a no-op.
    pub fn release(&self, id: RequestId) {
        if let Some((_, account_tag)) = self.in_flight.remove(&id) {
            self.capacity.release();
            self.quota.release(account_tag);
            metrics::admission_released();
            metrics::set_in_flight(self.in_flight.len() as u64);
            tracing::debug!(request_id = %id, "release: ok");
        } else {
            tracing::debug!(request_id = %id, "release: no-op, not in flight");
        }
    }

    /// Snapshots counters and gauges. Per-counter atomic consistency
    /// only — not a globally consistent snapshot across counters.
    pub async fn stats(&self) -> HashMap<String, u64> {
        let in_flight = self
            .capacity
            .snapshot()
            .await
            .map(|s| s.in_flight)
            .unwrap_or(0);
        let depths = self.queue.depths();
        self.stats.snapshot(&depths, in_flight)
    }

    pub fn set_policy(&self, policy: Policy) {
        tracing::info!(policy = ?policy, "admission_core: policy changed");
        self.policy.store(Arc::new(policy));
    }

    pub fn policy(&self) -> Policy {
        **self.policy.load()
    }

    /// `Admin.TimeRulesStatus()` / `Admin.TimeRulesApply()` live on this
    /// handle; the admin HTTP surface (`server::admin`) is a thin
    /// wrapper over it.
    pub fn rule_engine(&self) -> &RuleEngineHandle {
        &self.rule_engine
    }

    pub fn num_priority_levels(&self) -> usize {
        self.num_priority_levels
    }

    /// Graceful shutdown: stop the rule worker, reject everything still
    /// queued with `shutting_down`, stop the scheduler
    /// tick loop, then wait up to `timeout` for in-flight work to drain
    /// via `Release`. In-flight requests are never cancelled; a timeout
    /// only stops *waiting* for them and is surfaced via
    /// `shutdown_timeout` in stats.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!("admission_core: shutdown initiated");
        self.rule_engine.stop();
        self.shutting_down.store(true, Ordering::Relaxed);

        for req in self.queue.drain_all() {
            self.stats.incr_rejected();
            metrics::admission_rejected("shutting_down");
            if !req.deliver(ScheduleResult::rejected(RejectReason::ShuttingDown, Duration::ZERO)) {
                self.stats.incr_delivery_dropped();
            }
        }

        self.shutdown.notify_waiters();

        let drained = tokio::time::timeout(timeout, async {
            while !self.in_flight.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.in_flight.len(),
                "admission_core: shutdown timed out waiting for in-flight requests"
            );
            self.stats.incr_shutdown_timeout();
        }
        tracing::info!("admission_core: shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::Capacity;
    use crate::request::RequestBuilder;
    use std::time::Duration as StdDuration;

    fn config_with_capacity(max_concurrent: u64) -> CoreConfig {
        CoreConfig {
            num_priority_levels: 3,
            max_queue_depth: 10,
            scheduler_tick_ms: 10,
            capacity: Capacity {
                max_concurrent,
                max_rps: 0,
                max_tokens_per_sec: 0,
            },
            ..CoreConfig::default()
        }
    }

    /// S1 — pure admission.
    #[tokio::test]
    async fn s1_pure_admission() {
        let core = AdmissionCore::new(config_with_capacity(1)).unwrap();
        let (req, mut rx) = RequestBuilder::new(5).build();
        core.submit(req).await.unwrap();

        let result = rx.try_recv().expect("delivered synchronously");
        assert!(result.accepted);

        let stats = core.stats().await;
        assert_eq!(stats["in_flight"], 1);
        assert_eq!(stats["total_admitted"], 1);
    }

    /// S2 — concurrency queueing: second request queues, then is admitted
    /// within a couple of ticks after `Release`.
    #[tokio::test]
    async fn s2_concurrency_queueing() {
        let core = AdmissionCore::new(config_with_capacity(1)).unwrap();

        let (r1, mut rx1) = RequestBuilder::new(5).build();
        let id1 = r1.id;
        core.submit(r1).await.unwrap();
        assert!(rx1.try_recv().unwrap().accepted);

        let (r2, mut rx2) = RequestBuilder::new(5).build();
        core.submit(r2).await.unwrap();
        assert!(rx2.try_recv().is_err(), "second request must be queued, not delivered yet");

        core.release(id1);

        let result = tokio::time::timeout(StdDuration::from_millis(500), rx2)
            .await
            .expect("delivered within a few ticks")
            .unwrap();
        assert!(result.accepted);

        let stats = core.stats().await;
        assert_eq!(stats["total_admitted"], 2);
        assert_eq!(stats["total_queued"], 1);
    }

    /// S6 — expiration: a queued request past its deadline is rejected
    /// by the scheduler's sweep, not left hanging.
    #[tokio::test]
    async fn s6_expiration() {
        // max_concurrent=1, held by `hold`, forces the second request to queue.
        let core = AdmissionCore::new(config_with_capacity(1)).unwrap();
        let (hold, mut hold_rx) = RequestBuilder::new(0).build();
        core.submit(hold).await.unwrap();
        assert!(hold_rx.try_recv().unwrap().accepted);

        let (req, rx) = RequestBuilder::new(0)
            .deadline(std::time::Instant::now() + StdDuration::from_millis(50))
            .build();
        core.submit(req).await.unwrap();

        let result = tokio::time::timeout(StdDuration::from_millis(500), rx)
            .await
            .expect("scheduler delivers expiration")
            .unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, RejectReason::Expired);
    }

    #[tokio::test]
    async fn invalid_priority_is_rejected_synchronously() {
        let core = AdmissionCore::new(config_with_capacity(1)).unwrap();
        let (req, _rx) = RequestBuilder::new(99).build();
        assert_eq!(core.submit(req).await, Err(SubmitError::InvalidPriority));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let core = AdmissionCore::new(config_with_capacity(1)).unwrap();
        let (req, mut rx) = RequestBuilder::new(0).build();
        let id = req.id;
        core.submit(req).await.unwrap();
        assert!(rx.try_recv().unwrap().accepted);

        core.release(id);
        core.release(id);

        let stats = core.stats().await;
        assert_eq!(stats["in_flight"], 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_requests() {
        let core = AdmissionCore::new(config_with_capacity(1)).unwrap();
        let (hold, mut hold_rx) = RequestBuilder::new(0).build();
        core.submit(hold).await.unwrap();
        assert!(hold_rx.try_recv().unwrap().accepted);

        let (queued, rx) = RequestBuilder::new(0).build();
        core.submit(queued).await.unwrap();

        core.shutdown(StdDuration::from_millis(200)).await;

        let result = rx.await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.reason, RejectReason::ShuttingDown);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected_synchronously() {
        let core = AdmissionCore::new(config_with_capacity(1)).unwrap();
        core.shutdown(StdDuration::from_millis(100)).await;

        let (req, _rx) = RequestBuilder::new(0).build();
        assert_eq!(core.submit(req).await, Err(SubmitError::ShuttingDown));
    }
}
