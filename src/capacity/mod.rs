//! C2 — Capacity Manager.
//!
//! A single-owner actor: one dedicated tokio task owns the counters
//! outright. Every other context talks to it by sending messages on an
//! unbounded `tokio::sync::mpsc` channel and awaiting a per-call
//! `oneshot` reply (state lives behind one owner; everyone else reads
//! a snapshot or sends a message).

use tokio::sync::{mpsc, oneshot};

use crate::error::RejectReason;
use crate::limiter::WindowedLimiter;

/// The three admission-relevant capacity axes. `0` means "disabled" on
/// that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Capacity {
    #[serde(default)]
    pub max_concurrent: u64,
    #[serde(default)]
    pub max_rps: u64,
    #[serde(default)]
    pub max_tokens_per_sec: u64,
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            max_rps: 0,
            max_tokens_per_sec: 0,
        }
    }
}

enum Msg {
    CheckAndReserve {
        estimated_tokens: u64,
        reply: oneshot::Sender<Result<(), RejectReason>>,
    },
    Release,
    SetCapacity(Capacity),
    /// Atomic snapshot read, used by the stats surface and the admin API.
    Snapshot(oneshot::Sender<CapacitySnapshot>),
}

#[derive(Debug, Clone, Copy)]
pub struct CapacitySnapshot {
    pub in_flight: u64,
    pub capacity: Capacity,
}

/// Cheaply cloneable handle to the capacity actor.
#[derive(Clone)]
pub struct CapacityManager {
    tx: mpsc::UnboundedSender<Msg>,
}

impl CapacityManager {
    /// Spawn the owning task and return a handle to it.
    pub fn spawn(capacity: Capacity) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();

        tokio::spawn(async move {
            let mut limiter = WindowedLimiter::new(capacity);
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::CheckAndReserve {
                        estimated_tokens,
                        reply,
                    } => {
                        let result = limiter.check_and_reserve(
                            estimated_tokens,
                            RejectReason::ConcurrentLimit,
                            RejectReason::RpsLimit,
                            RejectReason::TokensLimit,
                        );
                        let _ = reply.send(result);
                    }
                    Msg::Release => limiter.release(),
                    Msg::SetCapacity(new_cap) => {
                        tracing::info!(
                            "capacity: reconfigured, max_concurrent={}, max_rps={}, max_tokens_per_sec={}",
                            new_cap.max_concurrent,
                            new_cap.max_rps,
                            new_cap.max_tokens_per_sec,
                        );
                        limiter.set_capacity(new_cap);
                    }
                    Msg::Snapshot(reply) => {
                        let _ = reply.send(CapacitySnapshot {
                            in_flight: limiter.in_flight(),
                            capacity: limiter.capacity(),
                        });
                    }
                }
            }
        });

        Self { tx }
    }

    /// Atomic admission decision over all three axes.
    pub async fn check_and_reserve(&self, estimated_tokens: u64) -> Result<(), RejectReason> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Msg::CheckAndReserve {
                estimated_tokens,
                reply: reply_tx,
            })
            .is_err()
        {
            // Actor is gone (shutdown raced us) — treat as capacity exhausted
            // rather than panicking the caller.
            return Err(RejectReason::ShuttingDown);
        }
        reply_rx.await.unwrap_or(Err(RejectReason::ShuttingDown))
    }

    /// Decrements in-flight. Fire-and-forget: the actor applies releases
    /// strictly before the next `CheckAndReserve` it dequeues, so a
    /// released slot is visible to the very next admission decision.
    pub fn release(&self) {
        let _ = self.tx.send(Msg::Release);
    }

    pub fn set_capacity(&self, capacity: Capacity) {
        let _ = self.tx.send(Msg::SetCapacity(capacity));
    }

    pub async fn snapshot(&self) -> Option<CapacitySnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(Msg::Snapshot(reply_tx)).ok()?;
        reply_rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_within_concurrency() {
        let mgr = CapacityManager::spawn(Capacity {
            max_concurrent: 1,
            max_rps: 0,
            max_tokens_per_sec: 0,
        });

        assert!(mgr.check_and_reserve(0).await.is_ok());
        let snap = mgr.snapshot().await.unwrap();
        assert_eq!(snap.in_flight, 1);
    }

    #[tokio::test]
    async fn rejects_over_concurrency_then_admits_after_release() {
        let mgr = CapacityManager::spawn(Capacity {
            max_concurrent: 1,
            max_rps: 0,
            max_tokens_per_sec: 0,
        });

        assert!(mgr.check_and_reserve(0).await.is_ok());
        assert_eq!(
            mgr.check_and_reserve(0).await,
            Err(RejectReason::ConcurrentLimit)
        );

        mgr.release();
        // release is processed strictly before the next check this handle sends.
        assert!(mgr.check_and_reserve(0).await.is_ok());
    }

    #[tokio::test]
    async fn rps_limit_rejects_third_request() {
        let mgr = CapacityManager::spawn(Capacity {
            max_concurrent: 100,
            max_rps: 2,
            max_tokens_per_sec: 0,
        });

        assert!(mgr.check_and_reserve(0).await.is_ok());
        assert!(mgr.check_and_reserve(0).await.is_ok());
        assert_eq!(mgr.check_and_reserve(0).await, Err(RejectReason::RpsLimit));
    }

    #[tokio::test]
    async fn tokens_limit_rejects_when_estimate_overflows_budget() {
        let mgr = CapacityManager::spawn(Capacity {
            max_concurrent: 100,
            max_rps: 0,
            max_tokens_per_sec: 1000,
        });

        assert!(mgr.check_and_reserve(600).await.is_ok());
        assert_eq!(
            mgr.check_and_reserve(500).await,
            Err(RejectReason::TokensLimit)
        );
    }

    #[tokio::test]
    async fn lowering_max_concurrent_below_in_flight_blocks_new_admissions() {
        let mgr = CapacityManager::spawn(Capacity {
            max_concurrent: 5,
            max_rps: 0,
            max_tokens_per_sec: 0,
        });

        for _ in 0..3 {
            assert!(mgr.check_and_reserve(0).await.is_ok());
        }

        mgr.set_capacity(Capacity {
            max_concurrent: 2,
            max_rps: 0,
            max_tokens_per_sec: 0,
        });

        assert_eq!(
            mgr.check_and_reserve(0).await,
            Err(RejectReason::ConcurrentLimit)
        );

        mgr.release();
        mgr.release();
        // in_flight now 1, below new bound of 2.
        assert!(mgr.check_and_reserve(0).await.is_ok());
    }
}
