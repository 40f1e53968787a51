//! Shared three-axis admission counter, used by both C2 (global capacity)
//! and C3 (per-pattern quota) — the two components share identical
//! bookkeeping over `{in_flight, rolling window}`, so the counter itself
//! is factored out rather than duplicated.

use std::time::{Duration, Instant};

use crate::capacity::Capacity;
use crate::error::RejectReason;

const WINDOW: Duration = Duration::from_secs(1);

pub struct WindowedLimiter {
    capacity: Capacity,
    in_flight: u64,
    window_start: Instant,
    window_requests: u64,
    window_tokens: u64,
}

impl WindowedLimiter {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            in_flight: 0,
            window_start: Instant::now(),
            window_requests: 0,
            window_tokens: 0,
        }
    }

    pub fn set_capacity(&mut self, capacity: Capacity) {
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    /// Checks concurrency, then the RPS window, then the token window,
    /// in that order; the first failure short-circuits the rest.
    pub fn check_and_reserve(
        &mut self,
        estimated_tokens: u64,
        concurrent_reason: RejectReason,
        rps_reason: RejectReason,
        tokens_reason: RejectReason,
    ) -> Result<(), RejectReason> {
        if self.capacity.max_concurrent > 0 && self.in_flight >= self.capacity.max_concurrent {
            return Err(concurrent_reason);
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.window_requests = 0;
            self.window_tokens = 0;
        }

        if self.capacity.max_rps > 0 && self.window_requests + 1 > self.capacity.max_rps {
            return Err(rps_reason);
        }

        if self.capacity.max_tokens_per_sec > 0
            && self.window_tokens + estimated_tokens > self.capacity.max_tokens_per_sec
        {
            return Err(tokens_reason);
        }

        self.in_flight += 1;
        self.window_requests += 1;
        self.window_tokens += estimated_tokens;
        Ok(())
    }

    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}
