//! Engine configuration.

use crate::catalog::ProductCatalog;
use crate::error::{GateError, Result};
use crate::types::{Category, Unit};
use crate::usage::DEFAULT_RETENTION_DAYS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lists a free user may own.
pub const MAX_FREE_LISTS: u32 = 3;

/// Notifications a free user may schedule per local day.
pub const MAX_FREE_NOTIFICATIONS_PER_DAY: u32 = 5;

/// Free-tier caps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Default: 3
    pub max_free_lists: u32,

    /// Default: 5
    pub max_free_notifications_per_day: u32,

    /// Categories usable without Premium.
    pub free_categories: Vec<Category>,

    /// Units usable without Premium.
    pub free_units: Vec<Unit>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_free_lists: MAX_FREE_LISTS,
            max_free_notifications_per_day: MAX_FREE_NOTIFICATIONS_PER_DAY,
            free_categories: Category::FREE.to_vec(),
            free_units: Unit::FREE.to_vec(),
        }
    }
}

/// Exponential backoff for reconnecting to the entitlement source.
///
/// delay = `initial_delay_ms` * multiplier ^ attempt, capped at `max_delay_ms`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Default: 500
    pub initial_delay_ms: u64,

    /// Default: 60000
    pub max_delay_ms: u64,

    /// Default: 2.0
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = if delay_ms.is_finite() {
            delay_ms.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory of the file-backed preference store.
    pub data_dir: PathBuf,

    pub limits: LimitsConfig,

    pub backoff: BackoffPolicy,

    /// Past days of usage counters kept on disk.
    /// Default: 30
    pub counter_retention_days: u32,

    /// Buffered tier events per channel subscriber before it is dropped.
    /// Default: 64
    pub observer_buffer_size: usize,

    /// Products that grant Premium.
    pub catalog: ProductCatalog,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./entitlements"),
            limits: LimitsConfig::default(),
            backoff: BackoffPolicy::default(),
            counter_retention_days: DEFAULT_RETENTION_DAYS,
            observer_buffer_size: 64,
            catalog: ProductCatalog::default(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: EngineConfig =
            serde_json::from_slice(&bytes).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog.is_empty() {
            return Err(GateError::Config("product catalog is empty".into()));
        }
        if self.observer_buffer_size == 0 {
            return Err(GateError::Config("observer_buffer_size must be positive".into()));
        }
        if !(self.backoff.multiplier >= 1.0) {
            return Err(GateError::Config(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            return Err(GateError::Config(
                "backoff initial delay exceeds max delay".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gate.json");
        std::fs::write(&path, r#"{"limits": {"max_free_lists": 2}}"#).unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.limits.max_free_lists, 2);
        assert_eq!(config.limits.max_free_notifications_per_day, 5);
        assert_eq!(config.catalog, ProductCatalog::default());
    }

    #[test]
    fn test_rejects_empty_catalog() {
        let config = EngineConfig {
            catalog: ProductCatalog::empty(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GateError::Config(_))));
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let config = EngineConfig {
            backoff: BackoffPolicy {
                multiplier: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
