//! Runtime configuration
//!
//! Loaded from `<config_dir>/ricepipe/config.toml` when present, then overlaid by
//! `RICEPIPE_*` environment variables (`RICEPIPE_CONCURRENCY=8`,
//! `RICEPIPE_STDERR=capture`, ...).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use ricepipe_core::default_concurrency;
use ricepipe_process::StderrPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes of stderr kept by [`StderrMode::Capture`]
pub const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024;

/// Configuration result type
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// What happens to a child's stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    #[default]
    Mirror,
    Capture,
    Discard,
}

impl StderrMode {
    pub fn policy(self) -> StderrPolicy {
        match self {
            StderrMode::Mirror => StderrPolicy::mirror(),
            StderrMode::Capture => StderrPolicy::capture(DEFAULT_CAPTURE_LIMIT),
            StderrMode::Discard => StderrPolicy::discard(),
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrency limit for mapping operators (None = hardware parallelism)
    pub concurrency: Option<usize>,
    pub stderr: StderrMode,
    /// Result cache directory (None = platform cache dir)
    pub cache_dir: Option<PathBuf>,
    pub cache_staleness_secs: u64,
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            stderr: StderrMode::Mirror,
            cache_dir: None,
            cache_staleness_secs: 24 * 60 * 60,
            log_level: "warn".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ricepipe")
            .join("config.toml")
    }

    /// Load from the default location and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load from `path` (optional) and the environment
    pub fn load_from(path: PathBuf) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("RICEPIPE").try_parsing(true))
            .build()?;
        let loaded: PipelineConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Validation(format!(
                "unknown log level `{}`",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Effective concurrency limit
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency)
    }

    /// Effective cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("ricepipe")
        })
    }

    pub fn cache_staleness(&self) -> Duration {
        Duration::from_secs(self.cache_staleness_secs)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_staleness(), Duration::from_secs(86_400));
        assert!(config.concurrency() >= 1);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = PipelineConfig {
            concurrency: Some(0),
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "concurrency = 3\nstderr = \"capture\"\ncache_staleness_secs = 60\n",
        )
        .unwrap();

        let config = PipelineConfig::load_from(path).unwrap();
        assert_eq!(config.concurrency, Some(3));
        assert_eq!(config.stderr, StderrMode::Capture);
        assert_eq!(config.cache_staleness(), Duration::from_secs(60));
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = PipelineConfig::load_from(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.stderr, StderrMode::Mirror);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "concurrency = 0\n").unwrap();
        assert!(PipelineConfig::load_from(path).is_err());
    }
}
