//! Top-level configuration: TOML or JSON by file extension, falling
//! back to built-in defaults when the file is absent, then validated
//! once at startup before anything is spawned.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::capacity::Capacity;
use crate::quota::QuotaRule;
use crate::rules::TimeRulesConfig;
use crate::scheduler::Policy;

fn default_num_priority_levels() -> usize {
    10
}

fn default_max_queue_depth() -> usize {
    1000
}

fn default_scheduler_tick_ms() -> u64 {
    100
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_num_priority_levels")]
    pub num_priority_levels: usize,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_scheduler_tick_ms")]
    pub scheduler_tick_ms: u64,
    #[serde(default)]
    pub policy: Policy,
    /// `None` means "use the geometric default for `num_priority_levels`".
    #[serde(default)]
    pub weights: Option<Vec<u32>>,
    #[serde(default)]
    pub capacity: Capacity,
    #[serde(default)]
    pub quotas: Vec<QuotaRule>,
    #[serde(default)]
    pub time_rules: TimeRulesConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            num_priority_levels: default_num_priority_levels(),
            max_queue_depth: default_max_queue_depth(),
            scheduler_tick_ms: default_scheduler_tick_ms(),
            policy: Policy::default(),
            weights: None,
            capacity: Capacity::default(),
            quotas: Vec::new(),
            time_rules: TimeRulesConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: CoreConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            CoreConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "loaded core configuration: {} priority levels, policy={:?}",
            config.num_priority_levels,
            config.policy,
        );
        Ok(config)
    }

    /// A small set of operational knobs are overridable without editing
    /// the config file, for ops-facing settings that change more often
    /// than the rest of the config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ADMISSION_SCHEDULER_TICK_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.scheduler_tick_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("ADMISSION_POLICY") {
            match v.to_ascii_lowercase().as_str() {
                "strict" => self.policy = Policy::Strict,
                "wfq" => self.policy = Policy::Wfq,
                "hybrid" => self.policy = Policy::Hybrid,
                other => tracing::warn!("config: unknown ADMISSION_POLICY={}, ignoring", other),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_priority_levels == 0 {
            anyhow::bail!("num_priority_levels must be positive");
        }
        if self.max_queue_depth == 0 {
            anyhow::bail!("max_queue_depth must be positive");
        }
        if let Some(w) = &self.weights {
            if w.len() != self.num_priority_levels {
                anyhow::bail!(
                    "weights length ({}) must equal num_priority_levels ({})",
                    w.len(),
                    self.num_priority_levels
                );
            }
        }
        for rule in &self.quotas {
            if rule.pattern.is_empty() {
                anyhow::bail!("quota pattern cannot be empty");
            }
        }
        Ok(())
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }

    /// `2^(N-1-i)`, clamped to avoid overflow for implausibly large `N`
    /// — the default geometric weighting when no explicit weights are
    /// configured.
    pub fn resolved_weights(&self) -> Vec<u32> {
        match &self.weights {
            Some(w) => w.clone(),
            None => {
                let n = self.num_priority_levels;
                (0..n).map(|i| 1u32 << (n - 1 - i).min(30)).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolved_weights().len(), config.num_priority_levels);
    }

    #[test]
    fn geometric_weights_favor_highest_priority() {
        let config = CoreConfig {
            num_priority_levels: 4,
            ..CoreConfig::default()
        };
        assert_eq!(config.resolved_weights(), vec![8, 4, 2, 1]);
    }

    #[test]
    fn mismatched_weights_length_fails_validation() {
        let config = CoreConfig {
            num_priority_levels: 3,
            weights: Some(vec![1, 2]),
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_priority_levels_fails_validation() {
        let config = CoreConfig {
            num_priority_levels: 0,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_missing() {
        let config = CoreConfig::load(Path::new("/nonexistent/path/sluice.toml")).unwrap();
        assert_eq!(config.num_priority_levels, default_num_priority_levels());
    }

    #[test]
    fn toml_round_trip() {
        let toml_str = r#"
            num_priority_levels = 5
            max_queue_depth = 50
            policy = "strict"

            [capacity]
            max_concurrent = 100
        "#;
        let config: CoreConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.num_priority_levels, 5);
        assert_eq!(config.policy, Policy::Strict);
        assert_eq!(config.capacity.max_concurrent, 100);
    }
}
