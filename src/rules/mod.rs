//! C5 — Rule Engine.
//!
//! A single worker task, same shape as C2/C3: an unbounded `mpsc`
//! control channel plus a `tokio::time::interval` driving periodic
//! re-evaluation. Nothing outside this task ever mutates rule state;
//! `Apply`/`Status` are messages, and reconfiguration of C2/C3/weights
//! goes out through their own existing control channels — this task
//! never reaches into their state directly. Rule application rides the
//! same channels as normal work, so it can never block `Submit` or
//! `ProcessQueues`.
//!
//! Time-window evaluation (day-of-week filtering, crossing-midnight
//! windows, IANA timezone lookup) uses `chrono` + `chrono_tz`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};

use crate::capacity::{Capacity, CapacityManager};
use crate::error::CoreError;
use crate::quota::{QuotaManager, QuotaRule};
use crate::stats::Stats;

fn default_enabled() -> bool {
    true
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TimeRulesConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default)]
    pub rules: Vec<TimeRuleConfig>,
}

impl Default for TimeRulesConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            default_timezone: default_timezone(),
            rules: Vec::new(),
        }
    }
}

impl TimeRulesConfig {
    /// Clamped to a minimum of 1s.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

/// Raw, deserializable rule description. Times are plain `HH:MM[:SS]`
/// strings rather than `chrono` types directly, so the wire format
/// doesn't depend on chrono's own serde impls.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TimeRuleConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub days_of_week: Vec<String>,
    pub timezone: Option<String>,
    pub payload: RulePayload,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulePayload {
    WeightAdjustment { weights: Vec<u32> },
    QuotaAdjustment { quotas: Vec<QuotaRule> },
    CapacityAdjustment { capacity: Capacity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RuleKind {
    Weight,
    Quota,
    Capacity,
}

impl RuleKind {
    /// Matches `RulePayload`'s own `#[serde(tag = "kind")]` spelling
    /// (`weight_adjustment`/`quota_adjustment`/`capacity_adjustment`) —
    /// the `type` string surfaced on `/admin/time-rules/status`.
    fn as_str(self) -> &'static str {
        match self {
            RuleKind::Weight => "weight_adjustment",
            RuleKind::Quota => "quota_adjustment",
            RuleKind::Capacity => "capacity_adjustment",
        }
    }
}

impl RulePayload {
    fn kind(&self) -> RuleKind {
        match self {
            RulePayload::WeightAdjustment { .. } => RuleKind::Weight,
            RulePayload::QuotaAdjustment { .. } => RuleKind::Quota,
            RulePayload::CapacityAdjustment { .. } => RuleKind::Capacity,
        }
    }
}

fn parse_weekday(s: &str) -> Result<Weekday, CoreError> {
    match s.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Ok(Weekday::Mon),
        "tue" | "tuesday" => Ok(Weekday::Tue),
        "wed" | "wednesday" => Ok(Weekday::Wed),
        "thu" | "thursday" => Ok(Weekday::Thu),
        "fri" | "friday" => Ok(Weekday::Fri),
        "sat" | "saturday" => Ok(Weekday::Sat),
        "sun" | "sunday" => Ok(Weekday::Sun),
        other => Err(CoreError::Config(format!("unknown day_of_week: {other}"))),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, CoreError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| CoreError::Config(format!("invalid time {s:?}: {e}")))
}

fn parse_zone(s: &str) -> Result<Tz, CoreError> {
    Tz::from_str(s).map_err(|_| CoreError::Config(format!("unknown timezone: {s:?}")))
}

/// A fully resolved rule, held only by the rule engine's own task.
struct CompiledRule {
    name: String,
    enabled: bool,
    start: NaiveTime,
    end: NaiveTime,
    days: Vec<Weekday>,
    zone: Tz,
    payload: RulePayload,
    was_active: bool,
    active_since: Option<DateTime<Utc>>,
    last_applied: Option<DateTime<Utc>>,
}

fn compile(config: &TimeRulesConfig) -> Result<Vec<CompiledRule>, CoreError> {
    let default_zone = parse_zone(&config.default_timezone)?;
    config
        .rules
        .iter()
        .map(|r| {
            let zone = match r.timezone.as_deref() {
                Some(z) => parse_zone(z)?,
                None => default_zone,
            };
            let days = r
                .days_of_week
                .iter()
                .map(|d| parse_weekday(d))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CompiledRule {
                name: r.name.clone(),
                enabled: r.enabled,
                start: parse_time(&r.start_time)?,
                end: parse_time(&r.end_time)?,
                days,
                zone,
                payload: r.payload.clone(),
                was_active: false,
                active_since: None,
                last_applied: None,
            })
        })
        .collect()
}

/// `end < start` means the window crosses midnight: active if
/// `t >= start || t < end`.
fn in_window(rule: &CompiledRule, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&rule.zone);
    if !rule.days.is_empty() && !rule.days.contains(&local.weekday()) {
        return false;
    }
    let t = local.time();
    if rule.start <= rule.end {
        t >= rule.start && t < rule.end
    } else {
        t >= rule.start || t < rule.end
    }
}

/// Baseline not named by a `quota_adjustment` rule is preserved rather
/// than carrying over a previously active rule's value. The rule's
/// patterns overlay the baseline by pattern name; patterns the rule
/// doesn't mention keep their baseline capacity.
fn merge_quota_rules(baseline: &[QuotaRule], overrides: &[QuotaRule]) -> Vec<QuotaRule> {
    let mut merged: HashMap<String, Capacity> =
        baseline.iter().map(|r| (r.pattern.clone(), r.capacity)).collect();
    for r in overrides {
        merged.insert(r.pattern.clone(), r.capacity);
    }
    merged
        .into_iter()
        .map(|(pattern, capacity)| QuotaRule { pattern, capacity })
        .collect()
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RuleStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub active: bool,
    pub window: String,
    pub last_applied: Option<DateTime<Utc>>,
}

struct EngineState {
    rules: Vec<CompiledRule>,
    applied: HashMap<RuleKind, Option<usize>>,
    weights: Arc<ArcSwap<Vec<u32>>>,
    weights_baseline: Vec<u32>,
    capacity: CapacityManager,
    capacity_baseline: Capacity,
    quota: QuotaManager,
    quotas_baseline: Vec<QuotaRule>,
    stats: Arc<Stats>,
}

impl EngineState {
    async fn tick(&mut self) {
        let now = Utc::now();

        for rule in &mut self.rules {
            let active = rule.enabled && in_window(rule, now);
            if active && !rule.was_active {
                rule.active_since = Some(now);
            }
            if !active {
                rule.active_since = None;
            }
            rule.was_active = active;
            crate::metrics::set_rule_active(&rule.name, active);
        }

        for kind in [RuleKind::Weight, RuleKind::Quota, RuleKind::Capacity] {
            self.apply_kind(kind, now).await;
        }
    }

    /// If multiple rules of the same kind are active at once, the one
    /// with the most recent active-since wins; ties fall to whichever
    /// was declared last, an arbitrary but deterministic tie-break.
    async fn apply_kind(&mut self, kind: RuleKind, now: DateTime<Utc>) {
        let active: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.was_active && r.payload.kind() == kind)
            .map(|(i, _)| i)
            .collect();

        if active.len() > 1 {
            tracing::warn!(
                "rules: {} rules simultaneously active for {:?}, applying the most recently transitioned",
                active.len(),
                kind,
            );
            self.stats.incr_rule_conflicts();
        }

        let winner = active
            .into_iter()
            .max_by_key(|&i| self.rules[i].active_since);

        let current = self.applied.get(&kind).copied().flatten();
        if winner == current {
            return;
        }

        match winner {
            Some(i) => {
                let payload = self.rules[i].payload.clone();
                crate::metrics::rule_applied(&self.rules[i].name);
                self.apply_payload(&payload).await;
                self.rules[i].last_applied = Some(now);
                self.applied.insert(kind, Some(i));
            }
            None => {
                self.restore_baseline(kind).await;
                self.applied.insert(kind, None);
            }
        }
    }

    async fn apply_payload(&self, payload: &RulePayload) {
        match payload {
            RulePayload::WeightAdjustment { weights } => {
                tracing::info!("rules: applying weight_adjustment, weights={:?}", weights);
                self.weights.store(Arc::new(weights.clone()));
            }
            RulePayload::QuotaAdjustment { quotas } => {
                tracing::info!("rules: applying quota_adjustment, patterns={}", quotas.len());
                self.quota.set_quotas(merge_quota_rules(&self.quotas_baseline, quotas));
            }
            RulePayload::CapacityAdjustment { capacity } => {
                tracing::info!("rules: applying capacity_adjustment, capacity={:?}", capacity);
                self.capacity.set_capacity(*capacity);
            }
        }
    }

    async fn restore_baseline(&self, kind: RuleKind) {
        tracing::info!("rules: no active rule for {:?}, restoring baseline", kind);
        match kind {
            RuleKind::Weight => self.weights.store(Arc::new(self.weights_baseline.clone())),
            RuleKind::Quota => self.quota.set_quotas(self.quotas_baseline.clone()),
            RuleKind::Capacity => self.capacity.set_capacity(self.capacity_baseline),
        }
    }

    fn status(&self) -> Vec<RuleStatus> {
        self.rules
            .iter()
            .map(|r| RuleStatus {
                name: r.name.clone(),
                kind: r.payload.kind().as_str(),
                active: r.was_active,
                window: format!("{}-{} {}", r.start.format("%H:%M:%S"), r.end.format("%H:%M:%S"), r.zone),
                last_applied: r.last_applied,
            })
            .collect()
    }
}

enum Msg {
    Apply(oneshot::Sender<()>),
    Status(oneshot::Sender<Vec<RuleStatus>>),
    Stop,
}

#[derive(Clone)]
pub struct RuleEngineHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl RuleEngineHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: TimeRulesConfig,
        weights: Arc<ArcSwap<Vec<u32>>>,
        weights_baseline: Vec<u32>,
        capacity: CapacityManager,
        capacity_baseline: Capacity,
        quota: QuotaManager,
        quotas_baseline: Vec<QuotaRule>,
        stats: Arc<Stats>,
    ) -> Result<Self, CoreError> {
        let rules = compile(&config)?;
        let tick_period = config.check_interval();
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();

        tokio::spawn(async move {
            let mut state = EngineState {
                rules,
                applied: HashMap::new(),
                weights,
                weights_baseline,
                capacity,
                capacity_baseline,
                quota,
                quotas_baseline,
                stats,
            };

            // Apply() semantics at startup: evaluate once before the first tick.
            state.tick().await;

            let mut interval = tokio::time::interval(tick_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        state.tick().await;
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(Msg::Apply(reply)) => {
                                state.tick().await;
                                let _ = reply.send(());
                            }
                            Some(Msg::Status(reply)) => {
                                let _ = reply.send(state.status());
                            }
                            Some(Msg::Stop) | None => {
                                tracing::info!("rule engine: stopping");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { tx })
    }

    pub async fn apply(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Apply(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }

    pub async fn status(&self) -> Vec<RuleStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Status(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Msg::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, start: &str, end: &str, payload: RulePayload) -> TimeRuleConfig {
        TimeRuleConfig {
            name: name.to_string(),
            enabled: true,
            start_time: start.to_string(),
            end_time: end.to_string(),
            days_of_week: vec![],
            timezone: None,
            payload,
        }
    }

    #[test]
    fn window_crossing_midnight_is_active_past_start_and_before_end() {
        let config = TimeRulesConfig {
            check_interval_secs: 60,
            default_timezone: "UTC".to_string(),
            rules: vec![rule(
                "overnight",
                "22:00:00",
                "06:00:00",
                RulePayload::CapacityAdjustment {
                    capacity: Capacity::default(),
                },
            )],
        };
        let compiled = compile(&config).unwrap();
        let rule = &compiled[0];

        let at_23 = DateTime::parse_from_rfc3339("2026-07-26T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let at_05 = DateTime::parse_from_rfc3339("2026-07-26T05:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let at_12 = DateTime::parse_from_rfc3339("2026-07-26T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert!(in_window(rule, at_23));
        assert!(in_window(rule, at_05));
        assert!(!in_window(rule, at_12));
    }

    #[test]
    fn days_of_week_filter_excludes_other_days() {
        let mut cfg = rule(
            "weekdays_only",
            "00:00:00",
            "23:59:59",
            RulePayload::CapacityAdjustment {
                capacity: Capacity::default(),
            },
        );
        cfg.days_of_week = vec!["mon".to_string(), "tue".to_string()];
        let config = TimeRulesConfig {
            check_interval_secs: 60,
            default_timezone: "UTC".to_string(),
            rules: vec![cfg],
        };
        let compiled = compile(&config).unwrap();
        let rule = &compiled[0];

        // 2026-07-26 is a Sunday.
        let sunday = DateTime::parse_from_rfc3339("2026-07-26T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        // 2026-07-27 is a Monday.
        let monday = DateTime::parse_from_rfc3339("2026-07-27T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert!(!in_window(rule, sunday));
        assert!(in_window(rule, monday));
    }

    #[test]
    fn merge_keeps_unlisted_baseline_patterns() {
        let baseline = vec![
            QuotaRule {
                pattern: "dept-eng-*".to_string(),
                capacity: Capacity {
                    max_concurrent: 5,
                    max_rps: 0,
                    max_tokens_per_sec: 0,
                },
            },
            QuotaRule {
                pattern: "dept-sales-*".to_string(),
                capacity: Capacity {
                    max_concurrent: 3,
                    max_rps: 0,
                    max_tokens_per_sec: 0,
                },
            },
        ];
        let overrides = vec![QuotaRule {
            pattern: "dept-eng-*".to_string(),
            capacity: Capacity {
                max_concurrent: 50,
                max_rps: 0,
                max_tokens_per_sec: 0,
            },
        }];

        let merged = merge_quota_rules(&baseline, &overrides);
        let eng = merged.iter().find(|r| r.pattern == "dept-eng-*").unwrap();
        let sales = merged.iter().find(|r| r.pattern == "dept-sales-*").unwrap();
        assert_eq!(eng.capacity.max_concurrent, 50);
        assert_eq!(sales.capacity.max_concurrent, 3);
    }

    #[tokio::test]
    async fn apply_and_status_round_trip() {
        let config = TimeRulesConfig {
            check_interval_secs: 3600,
            default_timezone: "UTC".to_string(),
            rules: vec![rule(
                "always_on",
                "00:00:00",
                "23:59:59",
                RulePayload::WeightAdjustment {
                    weights: vec![4, 2, 1],
                },
            )],
        };

        let weights = Arc::new(ArcSwap::from_pointee(vec![1u32, 1, 1]));
        let capacity_mgr = CapacityManager::spawn(Capacity::default());
        let quota_mgr = QuotaManager::spawn(vec![]);

        let handle = RuleEngineHandle::spawn(
            config,
            weights.clone(),
            vec![1, 1, 1],
            capacity_mgr,
            Capacity::default(),
            quota_mgr,
            vec![],
            Arc::new(Stats::default()),
        )
        .unwrap();

        handle.apply().await;
        assert_eq!(**weights.load(), vec![4, 2, 1]);

        let status = handle.status().await;
        assert_eq!(status.len(), 1);
        assert!(status[0].active);
        assert_eq!(status[0].kind, "weight_adjustment");
        assert!(status[0].last_applied.is_some());
    }

    /// Drives `EngineState::tick`/`apply_kind` through an active→inactive
    /// transition (not just activate-once) to confirm `restore_baseline`
    /// actually fires once a rule stops being active — the mechanism
    /// DESIGN.md cites as resolving spec.md §9's quota_adjustment Open
    /// Question.
    #[tokio::test]
    async fn capacity_reverts_to_baseline_once_rule_goes_inactive() {
        let baseline_capacity = Capacity {
            max_concurrent: 10,
            max_rps: 0,
            max_tokens_per_sec: 0,
        };
        let override_capacity = Capacity {
            max_concurrent: 200,
            max_rps: 0,
            max_tokens_per_sec: 0,
        };

        let config = TimeRulesConfig {
            check_interval_secs: 3600,
            default_timezone: "UTC".to_string(),
            rules: vec![rule(
                "lunch_peak",
                "00:00:00",
                "23:59:59",
                RulePayload::CapacityAdjustment {
                    capacity: override_capacity,
                },
            )],
        };

        let weights = Arc::new(ArcSwap::from_pointee(vec![1u32]));
        let capacity_mgr = CapacityManager::spawn(baseline_capacity);
        let quota_mgr = QuotaManager::spawn(vec![]);

        let mut state = EngineState {
            rules: compile(&config).unwrap(),
            applied: HashMap::new(),
            weights,
            weights_baseline: vec![1],
            capacity: capacity_mgr.clone(),
            capacity_baseline: baseline_capacity,
            quota: quota_mgr,
            quotas_baseline: vec![],
            stats: Arc::new(Stats::default()),
        };

        // Window covers all day, so the rule is active on the first tick.
        state.tick().await;
        let snap = capacity_mgr.snapshot().await.unwrap();
        assert_eq!(snap.capacity.max_concurrent, 200);

        // Simulate the rule leaving its active window (equivalent to
        // `enabled` flipping off, or the wall clock crossing `end_time`).
        state.rules[0].enabled = false;
        state.tick().await;

        let snap = capacity_mgr.snapshot().await.unwrap();
        assert_eq!(
            snap.capacity.max_concurrent, 10,
            "capacity must revert to baseline on the first tick after the rule goes inactive"
        );
    }
}
