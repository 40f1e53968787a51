//! C1 — Priority Queue Bank.
//!
//! One bounded FIFO per priority level, 0 (highest) through `N-1`. See
//! `level::Level` for the per-level locking discipline.

mod level;

pub use level::EnqueueOutcome;
use level::Level;

use std::time::Instant;

use crate::request::Request;

pub struct PriorityQueueBank {
    levels: Vec<Level>,
}

impl PriorityQueueBank {
    pub fn new(num_priority_levels: usize, max_queue_depth: usize) -> Self {
        let levels = (0..num_priority_levels)
            .map(|_| Level::new(max_queue_depth))
            .collect();
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn try_enqueue(&self, priority: usize, req: Request) -> EnqueueOutcome {
        self.levels[priority].try_enqueue(req)
    }

    pub fn try_dequeue(&self, priority: usize) -> Option<Request> {
        self.levels[priority].try_dequeue()
    }

    pub fn requeue_front(&self, priority: usize, req: Request) {
        self.levels[priority].requeue_front(req);
    }

    pub fn depth(&self, priority: usize) -> usize {
        self.levels[priority].depth()
    }

    pub fn depths(&self) -> Vec<usize> {
        self.levels.iter().map(Level::depth).collect()
    }

    /// Expiration sweep: O(1) peek per level, pop+return if expired.
    pub fn sweep_expired(&self, now: Instant) -> Vec<Request> {
        self.levels
            .iter()
            .filter_map(|level| level.pop_if_expired(now))
            .collect()
    }

    /// Drain every level, for graceful shutdown.
    pub fn drain_all(&self) -> Vec<Request> {
        self.levels.iter().flat_map(Level::drain).collect()
    }
}
