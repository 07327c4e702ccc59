//! clusterconfig.json parser.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading the cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("config rejected: {0}")]
    Invalid(String),
}

/// Cluster configuration snapshot.
///
/// Wire names are camelCase; every field is individually defaulted so a
/// partial file fills in the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Model identifier handed to each worker via its environment.
    pub model: String,
    /// Lower bound on pool size once initialized.
    pub min_instances: u32,
    /// Upper bound on pool size.
    pub max_instances: u32,
    /// Per-worker concurrent request capacity.
    pub max_concurrency: u32,
    /// Idle time before a worker becomes a scale-down candidate.
    pub idle_timeout_seconds: u64,
    /// Composite load at or above which the pool scales up.
    pub scale_up_load_threshold: f64,
    /// Composite load at or below which an idle worker may be removed.
    pub scale_down_load_threshold: f64,
    /// Smoothed cluster request rate that triggers a reactive scale-up.
    pub scale_up_rps: f64,
    /// Number of smoothed rate samples kept for trend computation.
    pub predictive_rps_window: usize,
    /// Trend slope above which a predictive scale-up fires.
    pub predictive_rps_trend_threshold: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            min_instances: 1,
            max_instances: 4,
            max_concurrency: 4,
            idle_timeout_seconds: 300,
            scale_up_load_threshold: 0.75,
            scale_down_load_threshold: 0.25,
            scale_up_rps: 50.0,
            predictive_rps_window: 10,
            predictive_rps_trend_threshold: 5.0,
        }
    }
}

impl ClusterConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, creating it with defaults if missing.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let defaults = ClusterConfig::default();
            std::fs::write(path, serde_json::to_string_pretty(&defaults)?)?;
            return Ok(defaults);
        }
        Self::load(path)
    }

    /// Reject configurations the control loop cannot operate under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_instances == 0 || self.max_instances == 0 || self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "minInstances, maxInstances and maxConcurrency must be positive".to_string(),
            ));
        }
        if self.min_instances > self.max_instances {
            return Err(ConfigError::Invalid(format!(
                "minInstances {} exceeds maxInstances {}",
                self.min_instances, self.max_instances
            )));
        }
        if self.predictive_rps_window == 0 {
            return Err(ConfigError::Invalid(
                "predictiveRpsWindow must be positive".to_string(),
            ));
        }
        if self.scale_down_load_threshold >= self.scale_up_load_threshold {
            return Err(ConfigError::Invalid(format!(
                "scaleDownLoadThreshold {} must be below scaleUpLoadThreshold {}",
                self.scale_down_load_threshold, self.scale_up_load_threshold
            )));
        }
        Ok(())
    }
}
