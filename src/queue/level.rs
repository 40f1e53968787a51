use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::request::Request;

/// Bounded FIFO for a single priority level.
///
/// Guarded by one `parking_lot::Mutex` for a short, uncontended critical
/// section. Because each level owns its own lock, an enqueue at level
/// `i` never contends with a dequeue at level `j != i`.
///
/// `pending` is the "head-of-line re-admit slot" described in the
/// design notes: when the scheduler dequeues a request and its
/// admission check fails, the request goes back here instead of the
/// back of the queue, so it is examined first on the next tick without
/// needing a full deque-prepend operation.
struct LevelInner {
    queue: VecDeque<Request>,
    pending: Option<Request>,
}

pub struct Level {
    inner: Mutex<LevelInner>,
    max_depth: usize,
    /// Approximate depth, readable without taking the lock.
    depth: AtomicUsize,
}

pub enum EnqueueOutcome {
    Ok,
    QueueFull,
}

impl Level {
    pub fn new(max_depth: usize) -> Self {
        Self {
            inner: Mutex::new(LevelInner {
                queue: VecDeque::new(),
                pending: None,
            }),
            max_depth,
            depth: AtomicUsize::new(0),
        }
    }

    /// Non-blocking enqueue at the tail. FIFO on arrival order.
    pub fn try_enqueue(&self, req: Request) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        let occupied = inner.queue.len() + inner.pending.is_some() as usize;
        if occupied >= self.max_depth {
            return EnqueueOutcome::QueueFull;
        }
        inner.queue.push_back(req);
        self.depth.fetch_add(1, Ordering::Relaxed);
        EnqueueOutcome::Ok
    }

    /// Non-blocking dequeue. Returns the pending (head-of-line
    /// re-admitted) request first if present, otherwise the queue head.
    pub fn try_dequeue(&self) -> Option<Request> {
        let mut inner = self.inner.lock();
        let req = inner.pending.take().or_else(|| inner.queue.pop_front());
        if req.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        req
    }

    /// Put a just-dequeued request back at the head, preserving its
    /// original `submitted_at`. Only ever called with at most one
    /// outstanding request per level per tick.
    pub fn requeue_front(&self, req: Request) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.pending.is_none(), "only one head-of-line slot at a time");
        inner.pending = Some(req);
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Approximate depth: may be off by the number of concurrent
    /// enqueues/dequeues in flight, as permitted by the contract.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// O(1) peek at the head's deadline, for the expiration sweep.
    /// Pops and returns the request if it has already expired.
    pub fn pop_if_expired(&self, now: Instant) -> Option<Request> {
        let mut inner = self.inner.lock();
        let expired = match inner.pending.as_ref().or_else(|| inner.queue.front()) {
            Some(req) => req.is_expired(now),
            None => false,
        };
        if !expired {
            return None;
        }
        let req = inner.pending.take().or_else(|| inner.queue.pop_front());
        if req.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        req
    }

    /// Drain everything (used on shutdown to reject remaining requests).
    pub fn drain(&self) -> Vec<Request> {
        let mut inner = self.inner.lock();
        let mut all: Vec<Request> = inner.pending.take().into_iter().collect();
        all.extend(inner.queue.drain(..));
        self.depth.store(0, Ordering::Relaxed);
        all
    }
}
