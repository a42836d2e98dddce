//! Engine configuration
//!
//! Stored as JSON. Missing fields take their defaults, a missing file
//! yields the default configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::analyzer::WeightTable;
use crate::error::{EngineError, Result};
use crate::types::RetryPolicy;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Defaults applied to every node that doesn't override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Per-invocation timeout
    pub default_timeout_ms: u64,
    /// Extra attempts after the first failure
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Delay inserted before every node invocation, 0 disables
    pub slow_mo_ms: u64,
    /// Consult the debug controller
    pub debug: bool,
    /// Weight overrides keyed by node type
    pub weights: HashMap<String, f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 0,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            slow_mo_ms: 0,
            debug: false,
            weights: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn default_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay_ms)
    }

    pub fn slow_mo(&self) -> Option<Duration> {
        (self.slow_mo_ms > 0).then(|| Duration::from_millis(self.slow_mo_ms))
    }

    pub fn weight_table(&self) -> WeightTable {
        WeightTable::with_overrides(self.weights.clone())
    }

    /// Reject values the engine can't run with
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(EngineError::Config("defaultTimeoutMs must be greater than 0".into()));
        }
        if let Some((node_type, weight)) = self.weights.iter().find(|(_, w)| !(w.is_finite() && **w > 0.0)) {
            return Err(EngineError::Config(format!(
                "weight for node type '{}' must be a positive number, got {}",
                node_type, weight
            )));
        }
        Ok(())
    }

    /// Load configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON, creating parent directories
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents).await?;

        log::info!("Engine configuration saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_retry(), RetryPolicy::new(0, 1000));
        assert_eq!(config.slow_mo(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"maxRetries": 2, "slowMoMs": 50}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.slow_mo(), Some(Duration::from_millis(50)));
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = EngineConfig {
            default_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let mut config = EngineConfig::default();
        config.weights.insert("llm".into(), -1.0);
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.json");

        let mut config = EngineConfig {
            max_retries: 3,
            ..Default::default()
        };
        config.weights.insert("shell".into(), 42.0);
        config.save(&path).await.unwrap();

        let loaded = EngineConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.weight_table().weight_for_type("shell"), 42.0);
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = EngineConfig::load(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(loaded, EngineConfig::default());
    }

    #[tokio::test]
    async fn test_invalid_json_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(matches!(
            EngineConfig::load(&path).await,
            Err(EngineError::Serialization(_))
        ));
    }
}
