use std::fmt;

/// Synchronous errors returned directly from `Submit`.
///
/// These never reach the request's `result_sink` — the caller learns
/// about them immediately, before the request is ever queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The target priority's queue was at `max_queue_depth`.
    QueueFull,
    /// `priority` was outside `[0, num_priority_levels)`.
    InvalidPriority,
    /// The core is draining or has already stopped.
    ShuttingDown,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::QueueFull => write!(f, "queue_full"),
            SubmitError::InvalidPriority => write!(f, "invalid_priority"),
            SubmitError::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Why a request was rejected or is still waiting, delivered via
/// `ScheduleResult::reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Still on a priority queue awaiting the next scheduler tick.
    Queued,
    /// `max_concurrent` was reached globally.
    ConcurrentLimit,
    /// `max_rps` was reached globally in the current window.
    RpsLimit,
    /// `max_tokens_per_sec` was reached globally in the current window.
    TokensLimit,
    /// The matching quota's `max_concurrent` was reached.
    QuotaConcurrentLimit,
    /// The matching quota's `max_rps` was reached.
    QuotaRpsLimit,
    /// The matching quota's `max_tokens_per_sec` was reached.
    QuotaTokensLimit,
    /// `deadline` elapsed while the request was queued.
    Expired,
    /// The core was shutting down while the request was still queued.
    ShuttingDown,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Queued => "queued",
            RejectReason::ConcurrentLimit => "concurrent_limit",
            RejectReason::RpsLimit => "rps_limit",
            RejectReason::TokensLimit => "tokens_limit",
            RejectReason::QuotaConcurrentLimit => "quota_concurrent_limit",
            RejectReason::QuotaRpsLimit => "quota_rps_limit",
            RejectReason::QuotaTokensLimit => "quota_tokens_limit",
            RejectReason::Expired => "expired",
            RejectReason::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Composition-root errors: config validation, bootstrap failures.
#[derive(Debug)]
pub enum CoreError {
    Config(String),
    Io(std::io::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Config(msg) => write!(f, "config error: {}", msg),
            CoreError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e)
    }
}
