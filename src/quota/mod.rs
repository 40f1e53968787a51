//! C3 — Quota Manager.
//!
//! Structurally identical to C2, but keyed by account-tag pattern, so
//! it reuses `limiter::WindowedLimiter` per matching pattern. A single
//! worker task owns a `HashMap<pattern, WindowedLimiter>`; sharding by
//! pattern hash is a straightforward future extension if one pattern's
//! contention becomes a bottleneck.

pub mod pattern;

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::capacity::Capacity;
use crate::error::RejectReason;
use crate::limiter::WindowedLimiter;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QuotaRule {
    pub pattern: String,
    #[serde(default)]
    pub capacity: Capacity,
}

enum Msg {
    CheckAndReserve {
        account_tag: Option<String>,
        estimated_tokens: u64,
        reply: oneshot::Sender<Result<(), RejectReason>>,
    },
    Release {
        account_tag: Option<String>,
    },
    /// Replaces the full quota map. Patterns not present revert to
    /// whatever the caller passes as baseline — the rule engine is
    /// responsible for resolving "revert to baseline" semantics before
    /// sending this message.
    SetQuotas(Vec<QuotaRule>),
    Snapshot(oneshot::Sender<Vec<QuotaPatternSnapshot>>),
}

#[derive(Debug, Clone)]
pub struct QuotaPatternSnapshot {
    pub pattern: String,
    pub in_flight: u64,
    pub capacity: Capacity,
}

#[derive(Clone)]
pub struct QuotaManager {
    tx: mpsc::UnboundedSender<Msg>,
}

struct QuotaState {
    patterns: HashMap<String, WindowedLimiter>,
}

impl QuotaState {
    fn new(rules: Vec<QuotaRule>) -> Self {
        let patterns = rules
            .into_iter()
            .map(|r| (r.pattern, WindowedLimiter::new(r.capacity)))
            .collect();
        Self { patterns }
    }

    fn best_pattern(&self, tag: &str) -> Option<String> {
        pattern::best_match(tag, self.patterns.keys().map(String::as_str)).map(String::from)
    }

    fn check_and_reserve(
        &mut self,
        account_tag: Option<&str>,
        estimated_tokens: u64,
    ) -> Result<(), RejectReason> {
        let Some(tag) = account_tag else {
            return Ok(());
        };
        let Some(pattern) = self.best_pattern(tag) else {
            // No matching pattern — unlimited.
            return Ok(());
        };
        let limiter = self.patterns.get_mut(&pattern).expect("pattern just matched");
        limiter.check_and_reserve(
            estimated_tokens,
            RejectReason::QuotaConcurrentLimit,
            RejectReason::QuotaRpsLimit,
            RejectReason::QuotaTokensLimit,
        )
    }

    fn release(&mut self, account_tag: Option<&str>) {
        let Some(tag) = account_tag else { return };
        if let Some(pattern) = self.best_pattern(tag) {
            if let Some(limiter) = self.patterns.get_mut(&pattern) {
                limiter.release();
            }
        }
    }
}

impl QuotaManager {
    pub fn spawn(rules: Vec<QuotaRule>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();

        tokio::spawn(async move {
            let mut state = QuotaState::new(rules);
            while let Some(msg) = rx.recv().await {
                match msg {
                    Msg::CheckAndReserve {
                        account_tag,
                        estimated_tokens,
                        reply,
                    } => {
                        let result =
                            state.check_and_reserve(account_tag.as_deref(), estimated_tokens);
                        let _ = reply.send(result);
                    }
                    Msg::Release { account_tag } => state.release(account_tag.as_deref()),
                    Msg::SetQuotas(rules) => {
                        tracing::info!("quota: reconfigured, patterns={}", rules.len());
                        state = QuotaState::new(rules);
                    }
                    Msg::Snapshot(reply) => {
                        let snap = state
                            .patterns
                            .iter()
                            .map(|(pattern, limiter)| QuotaPatternSnapshot {
                                pattern: pattern.clone(),
                                in_flight: limiter.in_flight(),
                                capacity: limiter.capacity(),
                            })
                            .collect();
                        let _ = reply.send(snap);
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn check_and_reserve(
        &self,
        account_tag: Option<String>,
        estimated_tokens: u64,
    ) -> Result<(), RejectReason> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Msg::CheckAndReserve {
                account_tag,
                estimated_tokens,
                reply: reply_tx,
            })
            .is_err()
        {
            return Err(RejectReason::ShuttingDown);
        }
        reply_rx.await.unwrap_or(Err(RejectReason::ShuttingDown))
    }

    pub fn release(&self, account_tag: Option<String>) {
        let _ = self.tx.send(Msg::Release { account_tag });
    }

    pub fn set_quotas(&self, rules: Vec<QuotaRule>) {
        let _ = self.tx.send(Msg::SetQuotas(rules));
    }

    pub async fn snapshot(&self) -> Vec<QuotaPatternSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Snapshot(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, max_concurrent: u64) -> QuotaRule {
        QuotaRule {
            pattern: pattern.to_string(),
            capacity: Capacity {
                max_concurrent,
                max_rps: 0,
                max_tokens_per_sec: 0,
            },
        }
    }

    #[tokio::test]
    async fn unlimited_when_no_account_tag() {
        let mgr = QuotaManager::spawn(vec![rule("dept-eng-*", 1)]);
        assert!(mgr.check_and_reserve(None, 0).await.is_ok());
    }

    #[tokio::test]
    async fn unlimited_when_no_pattern_matches() {
        let mgr = QuotaManager::spawn(vec![rule("dept-eng-*", 1)]);
        assert!(mgr
            .check_and_reserve(Some("dept-sales-1".to_string()), 0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn enforces_matched_pattern_concurrency() {
        let mgr = QuotaManager::spawn(vec![rule("dept-eng-*", 1)]);
        let tag = "dept-eng-42".to_string();
        assert!(mgr.check_and_reserve(Some(tag.clone()), 0).await.is_ok());
        assert_eq!(
            mgr.check_and_reserve(Some(tag.clone()), 0).await,
            Err(RejectReason::QuotaConcurrentLimit)
        );
        mgr.release(Some(tag.clone()));
        assert!(mgr.check_and_reserve(Some(tag), 0).await.is_ok());
    }

    #[tokio::test]
    async fn picks_most_specific_pattern() {
        let mgr = QuotaManager::spawn(vec![rule("dept-*", 100), rule("dept-eng-*", 1)]);
        let tag = "dept-eng-42".to_string();
        assert!(mgr.check_and_reserve(Some(tag.clone()), 0).await.is_ok());
        assert_eq!(
            mgr.check_and_reserve(Some(tag), 0).await,
            Err(RejectReason::QuotaConcurrentLimit)
        );
    }
}
