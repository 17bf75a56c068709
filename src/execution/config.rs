//! Engine Configuration
//!
//! Settings are read from a YAML file; every field is optional.
//!
//! ```yaml
//! workers: 8
//! max_live_threads: 1000
//! max_threads_per_job: 200
//! machine: build-host-1
//! result_dir: .actiontree/results
//! shutdown_grace_ms: 5000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of OS worker threads
    pub workers: usize,

    /// Cap on live logical threads across all jobs, 0 for unlimited
    pub max_live_threads: usize,

    /// Cap on live logical threads within one job, 0 for unlimited
    pub max_threads_per_job: usize,

    /// Machine name recorded in action metadata
    pub machine: String,

    /// Directory completed job results are written to
    pub result_dir: Option<PathBuf>,

    /// How long shutdown waits for terminated jobs before forcing completion
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            max_live_threads: 0,
            max_threads_per_job: 0,
            machine: "local".to_string(),
            result_dir: None,
            shutdown_grace_ms: 5000,
        }
    }
}

impl EngineConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.machine.trim().is_empty() {
            return Err(ConfigError::Invalid("machine must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_live_threads(mut self, limit: usize) -> Self {
        self.max_live_threads = limit;
        self
    }

    pub fn with_max_threads_per_job(mut self, limit: usize) -> Self {
        self.max_threads_per_job = limit;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn with_result_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.result_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.max_live_threads, 0);
        assert_eq!(config.machine, "local");
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml("max_live_threads: 50\n").unwrap();
        assert_eq!(config.max_live_threads, 50);
        assert_eq!(config.machine, "local");
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_empty_yaml() {
        assert_eq!(EngineConfig::from_yaml("").unwrap().max_threads_per_job, 0);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = EngineConfig::from_yaml("workers: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_types_rejected() {
        let err = EngineConfig::from_yaml("workers: many\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "workers: 3\nresult_dir: out\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.result_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load("/nonexistent/engine.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_workers(2)
            .with_max_live_threads(10)
            .with_max_threads_per_job(5)
            .with_result_dir("results");
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_threads_per_job, 5);
        assert_eq!(config.result_dir, Some(PathBuf::from("results")));
    }
}
