//! C4 — Scheduler Loop.
//!
//! Periodically drains `queue::PriorityQueueBank` according to the
//! active `Policy` and re-submits dequeued requests to C2/C3. The
//! deficit-counter state for WFQ lives only inside this task's stack
//! frame — nothing outside the scheduler task ever reads or writes it,
//! keeping it single-owner like C2/C3.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::capacity::CapacityManager;
use crate::error::RejectReason;
use crate::queue::PriorityQueueBank;
use crate::quota::QuotaManager;
use crate::request::{Request, RequestId, ScheduleResult};
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Strict,
    Wfq,
    Hybrid,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Hybrid
    }
}

/// In-flight bookkeeping shared between the direct-admit path in
/// `AdmissionCore::submit` and the scheduler's queued-admit path, so
/// `Release` can find which account (if any) to credit back — and so a
/// second `Release` on the same id is a provable no-op.
pub type InFlightRegistry = Arc<DashMap<RequestId, Option<String>>>;

pub struct SchedulerLoop {
    queue: Arc<PriorityQueueBank>,
    capacity: CapacityManager,
    quota: QuotaManager,
    policy: Arc<ArcSwap<Policy>>,
    weights: Arc<ArcSwap<Vec<u32>>>,
    stats: Arc<Stats>,
    in_flight: InFlightRegistry,
    tick: Duration,
    shutdown: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
}

impl SchedulerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<PriorityQueueBank>,
        capacity: CapacityManager,
        quota: QuotaManager,
        policy: Arc<ArcSwap<Policy>>,
        weights: Arc<ArcSwap<Vec<u32>>>,
        stats: Arc<Stats>,
        in_flight: InFlightRegistry,
        tick: Duration,
        shutdown: Arc<Notify>,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            queue,
            capacity,
            quota,
            policy,
            weights,
            stats,
            in_flight,
            tick,
            shutdown,
            shutting_down,
        }
    }

    /// Spawn the tick loop. Returns immediately; the loop runs until
    /// `shutdown` is notified.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut deficits = vec![0i64; self.queue.num_levels()];
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.process_queues(&mut deficits).await;
                    }
                    _ = self.shutdown.notified() => {
                        tracing::info!("scheduler: shutdown signal received, stopping tick loop");
                        return;
                    }
                }
            }
        })
    }

    async fn process_queues(&self, deficits: &mut [i64]) {
        self.sweep_expired();
        self.publish_queue_depth_gauges();

        if self.shutting_down.load(Ordering::Relaxed) {
            self.reject_all_queued(RejectReason::ShuttingDown);
            return;
        }

        match *self.policy.load().as_ref() {
            Policy::Strict => {
                self.process_strict(0, self.queue.num_levels()).await;
            }
            Policy::Wfq => {
                self.process_wfq(0, self.queue.num_levels(), deficits).await;
            }
            Policy::Hybrid => {
                if self.queue.num_levels() > 0 {
                    self.process_strict(0, 1).await;
                }
                if self.queue.num_levels() > 1 {
                    self.process_wfq(1, self.queue.num_levels(), deficits).await;
                }
            }
        }
    }

    fn publish_queue_depth_gauges(&self) {
        for (p, depth) in self.queue.depths().into_iter().enumerate() {
            crate::metrics::set_queue_depth(p, depth);
        }
    }

    /// Expiration sweep: O(1) peek per level, reject anything overdue.
    fn sweep_expired(&self) {
        let now = Instant::now();
        for req in self.queue.sweep_expired(now) {
            self.stats.incr_expired();
            crate::metrics::admission_rejected("expired");
            let wait = req_wait(&req, now);
            self.deliver(req, ScheduleResult::rejected(RejectReason::Expired, wait));
        }
    }

    /// Strict priority over levels `[start, end)`. A capacity/quota
    /// rejection re-enqueues at the head and stops processing — not just
    /// this level, but every lower-priority level too, so a blocked head
    /// never lets lower priority work jump the queue.
    async fn process_strict(&self, start: usize, end: usize) {
        for p in start..end {
            loop {
                let Some(req) = self.queue.try_dequeue(p) else {
                    break;
                };

                let now = Instant::now();
                if req.is_expired(now) {
                    self.stats.incr_expired();
                    crate::metrics::admission_rejected("expired");
                    self.deliver(req, ScheduleResult::rejected(RejectReason::Expired, Duration::ZERO));
                    continue;
                }

                match self.try_admit(&req).await {
                    Ok(()) => {
                        let wait = now.saturating_duration_since(req.submitted_at);
                        self.mark_admitted(&req);
                        self.deliver(req, ScheduleResult::admitted(wait));
                    }
                    Err(_reason) => {
                        self.queue.requeue_front(p, req);
                        return;
                    }
                }
            }
        }
    }

    /// Weighted fair queueing over levels `[start, end)`. `deficits` is
    /// indexed by absolute level number and owned exclusively by the
    /// scheduler task.
    async fn process_wfq(&self, start: usize, end: usize, deficits: &mut [i64]) {
        let weights = self.weights.load();

        for p in start..end {
            if self.queue.depth(p) == 0 {
                continue;
            }
            let w = weights.get(p).copied().unwrap_or(1) as i64;
            deficits[p] += w.max(1);
        }

        for p in start..end {
            loop {
                if deficits[p] <= 0 {
                    break;
                }
                let Some(req) = self.queue.try_dequeue(p) else {
                    break;
                };

                let now = Instant::now();
                if req.is_expired(now) {
                    self.stats.incr_expired();
                    crate::metrics::admission_rejected("expired");
                    self.deliver(req, ScheduleResult::rejected(RejectReason::Expired, Duration::ZERO));
                    continue;
                }

                let cost = (req.estimated_tokens / 1000).max(1) as i64;

                match self.try_admit(&req).await {
                    Ok(()) => {
                        let wait = now.saturating_duration_since(req.submitted_at);
                        self.mark_admitted(&req);
                        self.deliver(req, ScheduleResult::admitted(wait));
                        deficits[p] -= cost;
                    }
                    Err(_reason) => {
                        self.queue.requeue_front(p, req);
                        break;
                    }
                }
            }
        }
    }

    /// Checks C2 then C3; rolls back C2's reservation if C3 rejects,
    /// so a single request never holds a dangling capacity reservation
    /// after a quota rejection.
    async fn try_admit(&self, req: &Request) -> Result<(), RejectReason> {
        try_admit(&self.capacity, &self.quota, req).await
    }

    fn mark_admitted(&self, req: &Request) {
        self.in_flight.insert(req.id, req.account_tag.clone());
        self.stats.incr_admitted();
    }

    fn deliver(&self, req: Request, result: ScheduleResult) {
        if !req.deliver(result) {
            self.stats.incr_delivery_dropped();
        }
    }

    /// Shutdown path: reject everything still sitting in C1 with
    /// `shutting_down`.
    fn reject_all_queued(&self, reason: RejectReason) {
        for req in self.queue.drain_all() {
            self.stats.incr_rejected();
            crate::metrics::admission_rejected(reason.as_str());
            self.deliver(req, ScheduleResult::rejected(reason, Duration::ZERO));
        }
    }
}

fn req_wait(req: &Request, now: Instant) -> Duration {
    now.saturating_duration_since(req.submitted_at)
}

/// Shared C2-then-C3 admission transaction, used both by the scheduler's
/// queued-admit path and by `AdmissionCore::submit`'s direct-admit path —
/// both entry points share identical rollback semantics, so the
/// transaction itself is factored out rather than duplicated.
pub(crate) async fn try_admit(
    capacity: &CapacityManager,
    quota: &QuotaManager,
    req: &Request,
) -> Result<(), RejectReason> {
    capacity.check_and_reserve(req.estimated_tokens).await?;
    match quota
        .check_and_reserve(req.account_tag.clone(), req.estimated_tokens)
        .await
    {
        Ok(()) => Ok(()),
        Err(reason) => {
            capacity.release();
            Err(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::Capacity;
    use crate::queue::EnqueueOutcome;
    use crate::request::RequestBuilder;

    fn test_loop(
        levels: usize,
        max_depth: usize,
        capacity: Capacity,
        policy: Policy,
        weights: Vec<u32>,
    ) -> (Arc<PriorityQueueBank>, SchedulerLoop) {
        let queue = Arc::new(PriorityQueueBank::new(levels, max_depth));
        let cap_mgr = CapacityManager::spawn(capacity);
        let quota_mgr = QuotaManager::spawn(vec![]);
        let stats = Arc::new(Stats::default());
        let in_flight = Arc::new(DashMap::new());
        let shutdown = Arc::new(Notify::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let sched = SchedulerLoop::new(
            queue.clone(),
            cap_mgr,
            quota_mgr,
            Arc::new(ArcSwap::from_pointee(policy)),
            Arc::new(ArcSwap::from_pointee(weights)),
            stats,
            in_flight,
            Duration::from_millis(10),
            shutdown,
            shutting_down,
        );
        (queue, sched)
    }

    #[tokio::test]
    async fn strict_admits_highest_priority_first_when_capacity_frees() {
        let (queue, sched) = test_loop(
            3,
            10,
            Capacity {
                max_concurrent: 1,
                max_rps: 0,
                max_tokens_per_sec: 0,
            },
            Policy::Strict,
            vec![1, 1, 1],
        );

        // Occupy the one concurrency slot directly via capacity manager.
        assert!(sched.capacity.check_and_reserve(0).await.is_ok());

        let (low, mut low_rx) = RequestBuilder::new(2).build();
        let (high, mut high_rx) = RequestBuilder::new(0).build();
        assert!(matches!(queue.try_enqueue(2, low), EnqueueOutcome::Ok));
        assert!(matches!(queue.try_enqueue(0, high), EnqueueOutcome::Ok));

        let mut deficits = vec![0i64; 3];
        // First tick: capacity still full (1/1), both stay queued.
        sched.process_queues(&mut deficits).await;
        assert!(low_rx.try_recv().is_err());
        assert!(high_rx.try_recv().is_err());

        sched.capacity.release();

        // Next tick: capacity frees up, strict order admits p0 before p2.
        sched.process_queues(&mut deficits).await;
        let high_result = high_rx.try_recv().expect("high priority admitted");
        assert!(high_result.accepted);
        assert!(low_rx.try_recv().is_err(), "low priority must still be queued");
    }

    #[tokio::test]
    async fn wfq_admits_with_deficit_and_preserves_on_capacity_failure() {
        let (queue, sched) = test_loop(
            2,
            10,
            Capacity {
                max_concurrent: 0,
                max_rps: 0,
                max_tokens_per_sec: 0,
            },
            Policy::Wfq,
            vec![2, 1],
        );

        let (r0, mut rx0) = RequestBuilder::new(0).build();
        let (r1, mut rx1) = RequestBuilder::new(1).build();
        queue.try_enqueue(0, r0);
        queue.try_enqueue(1, r1);

        let mut deficits = vec![0i64; 2];
        sched.process_queues(&mut deficits).await;

        assert!(rx0.try_recv().expect("p0 admitted").accepted);
        assert!(rx1.try_recv().expect("p1 admitted").accepted);
    }

    #[tokio::test]
    async fn expired_request_is_rejected_not_requeued() {
        let (queue, sched) = test_loop(
            1,
            10,
            Capacity::default(),
            Policy::Strict,
            vec![1],
        );

        let (req, mut rx) = RequestBuilder::new(0)
            .deadline(Instant::now() - Duration::from_millis(1))
            .build();
        queue.try_enqueue(0, req);

        let mut deficits = vec![0i64; 1];
        sched.process_queues(&mut deficits).await;

        let result = rx.try_recv().expect("expired delivered");
        assert!(!result.accepted);
        assert_eq!(result.reason, RejectReason::Expired);
        assert_eq!(queue.depth(0), 0);
    }
}
