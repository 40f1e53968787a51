use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::RejectReason;

/// Opaque identifier, unique within the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Mint a fresh, process-unique id.
    pub fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The final, single outcome delivered to a request's `result_sink`.
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    pub accepted: bool,
    pub reason: RejectReason,
    pub wait_duration: Duration,
}

impl ScheduleResult {
    pub fn admitted(wait_duration: Duration) -> Self {
        Self {
            accepted: true,
            reason: RejectReason::Queued,
            wait_duration,
        }
    }

    pub fn rejected(reason: RejectReason, wait_duration: Duration) -> Self {
        Self {
            accepted: false,
            reason,
            wait_duration,
        }
    }
}

/// Single-consumer, capacity-1 delivery channel. A `Request` carries the
/// sending half; the caller holds the receiving half.
pub type ResultSender = oneshot::Sender<ScheduleResult>;
pub type ResultReceiver = oneshot::Receiver<ScheduleResult>;

/// A single inbound model-inference request as it arrives at `Submit`.
pub struct Request {
    pub id: RequestId,
    pub priority: usize,
    pub account_tag: Option<String>,
    pub estimated_tokens: u64,
    pub submitted_at: Instant,
    pub deadline: Option<Instant>,
    pub(crate) result_sink: ResultSender,
}

/// Builder-style constructor for assembling a `Request` with optional
/// fields defaulted.
pub struct RequestBuilder {
    priority: usize,
    account_tag: Option<String>,
    estimated_tokens: u64,
    deadline: Option<Instant>,
}

impl RequestBuilder {
    pub fn new(priority: usize) -> Self {
        Self {
            priority,
            account_tag: None,
            estimated_tokens: 0,
            deadline: None,
        }
    }

    pub fn account_tag(mut self, tag: impl Into<String>) -> Self {
        self.account_tag = Some(tag.into());
        self
    }

    pub fn estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.deadline = Some(Instant::now() + ttl);
        self
    }

    /// Build the request and its matching receiver.
    pub fn build(self) -> (Request, ResultReceiver) {
        let (tx, rx) = oneshot::channel();
        let req = Request {
            id: RequestId::next(),
            priority: self.priority,
            account_tag: self.account_tag,
            estimated_tokens: self.estimated_tokens,
            submitted_at: Instant::now(),
            deadline: self.deadline,
            result_sink: tx,
        };
        (req, rx)
    }
}

impl Request {
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now > d)
    }

    /// Deliver the final result. A closed receiver (caller dropped it) is a
    /// no-op, counted by the caller as `delivery_dropped` — never an error.
    pub fn deliver(self, result: ScheduleResult) -> bool {
        self.result_sink.send(result).is_ok()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("account_tag", &self.account_tag)
            .field("estimated_tokens", &self.estimated_tokens)
            .finish()
    }
}
