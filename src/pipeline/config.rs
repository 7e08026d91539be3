//! Orchestrator configuration.
//!
//! Settings come from three layers: built-in defaults, an optional YAML
//! file, and `CAPFORGE_*` environment variables. Every constructor
//! validates the result before handing it out.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::diversity::{
    DistanceMetric, DiversitySelector, ProjectionParams, ScoringStrategy,
    DEFAULT_APPROXIMATE_THRESHOLD, DEFAULT_PROJECTION_DIMENSION,
};
use crate::progress::DEFAULT_RATE_WINDOW;
use crate::stage::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the job orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    // Execution settings
    /// Maximum number of jobs executing stages at the same time.
    pub max_concurrent_jobs: usize,
    /// Attempts per stage invocation for retryable model errors.
    pub model_retry_attempts: u32,
    /// Pause between retry attempts.
    pub retry_backoff: Duration,

    // Progress settings
    /// Number of rate samples smoothed into `frames_per_second`.
    pub eta_window: usize,
    /// How often the progress monitor logs job counts.
    pub progress_log_interval: Duration,

    // Curation settings
    /// Distance over candidate embeddings.
    pub distance_metric: DistanceMetric,
    /// Pool size above which selection uses random projection.
    pub approximate_threshold: usize,
    /// Target dimension of the random projection.
    pub projection_dimension: usize,
    /// Seed of the random projection.
    pub projection_seed: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            model_retry_attempts: 3,
            retry_backoff: Duration::from_millis(500),

            eta_window: DEFAULT_RATE_WINDOW,
            progress_log_interval: Duration::from_secs(30),

            distance_metric: DistanceMetric::Euclidean,
            approximate_threshold: DEFAULT_APPROXIMATE_THRESHOLD,
            projection_dimension: DEFAULT_PROJECTION_DIMENSION,
            projection_seed: 42,
        }
    }
}

/// On-disk form of [`OrchestratorConfig`]. Missing keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    max_concurrent_jobs: Option<usize>,
    model_retry_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    eta_window: Option<usize>,
    progress_log_interval_secs: Option<u64>,
    distance_metric: Option<DistanceMetric>,
    approximate_threshold: Option<usize>,
    projection_dimension: Option<usize>,
    projection_seed: Option<u64>,
}

impl ConfigFile {
    fn apply(self, config: &mut OrchestratorConfig) {
        if let Some(v) = self.max_concurrent_jobs {
            config.max_concurrent_jobs = v;
        }
        if let Some(v) = self.model_retry_attempts {
            config.model_retry_attempts = v;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(v) = self.eta_window {
            config.eta_window = v;
        }
        if let Some(secs) = self.progress_log_interval_secs {
            config.progress_log_interval = Duration::from_secs(secs);
        }
        if let Some(v) = self.distance_metric {
            config.distance_metric = v;
        }
        if let Some(v) = self.approximate_threshold {
            config.approximate_threshold = v;
        }
        if let Some(v) = self.projection_dimension {
            config.projection_dimension = v;
        }
        if let Some(v) = self.projection_seed {
            config.projection_seed = v;
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CAPFORGE_MAX_CONCURRENT_JOBS`: Concurrent jobs (default: 4)
    /// - `CAPFORGE_MODEL_RETRY_ATTEMPTS`: Attempts for model errors (default: 3)
    /// - `CAPFORGE_RETRY_BACKOFF_MS`: Pause between attempts (default: 500)
    /// - `CAPFORGE_ETA_WINDOW`: Rate samples to smooth (default: 10)
    /// - `CAPFORGE_PROGRESS_LOG_INTERVAL_SECS`: Monitor interval (default: 30)
    /// - `CAPFORGE_DISTANCE_METRIC`: `euclidean` or `angular` (default: euclidean)
    /// - `CAPFORGE_APPROXIMATE_THRESHOLD`: Pool size for projection (default: 20000)
    /// - `CAPFORGE_PROJECTION_DIMENSION`: Projected dimension (default: 32)
    /// - `CAPFORGE_PROJECTION_SEED`: Projection seed (default: 42)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a YAML file, then applies environment overrides on top.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML over the defaults, without environment overrides.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if !content.trim().is_empty() {
            let file: ConfigFile = serde_yaml::from_str(content)?;
            file.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Execution settings
        if let Ok(val) = std::env::var("CAPFORGE_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = parse_env_value(&val, "CAPFORGE_MAX_CONCURRENT_JOBS")?;
        }

        if let Ok(val) = std::env::var("CAPFORGE_MODEL_RETRY_ATTEMPTS") {
            self.model_retry_attempts = parse_env_value(&val, "CAPFORGE_MODEL_RETRY_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("CAPFORGE_RETRY_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "CAPFORGE_RETRY_BACKOFF_MS")?;
            self.retry_backoff = Duration::from_millis(ms);
        }

        // Progress settings
        if let Ok(val) = std::env::var("CAPFORGE_ETA_WINDOW") {
            self.eta_window = parse_env_value(&val, "CAPFORGE_ETA_WINDOW")?;
        }

        if let Ok(val) = std::env::var("CAPFORGE_PROGRESS_LOG_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CAPFORGE_PROGRESS_LOG_INTERVAL_SECS")?;
            self.progress_log_interval = Duration::from_secs(secs);
        }

        // Curation settings
        if let Ok(val) = std::env::var("CAPFORGE_DISTANCE_METRIC") {
            self.distance_metric = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "CAPFORGE_DISTANCE_METRIC".to_string(),
                message,
            })?;
        }

        if let Ok(val) = std::env::var("CAPFORGE_APPROXIMATE_THRESHOLD") {
            self.approximate_threshold = parse_env_value(&val, "CAPFORGE_APPROXIMATE_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("CAPFORGE_PROJECTION_DIMENSION") {
            self.projection_dimension = parse_env_value(&val, "CAPFORGE_PROJECTION_DIMENSION")?;
        }

        if let Ok(val) = std::env::var("CAPFORGE_PROJECTION_SEED") {
            self.projection_seed = parse_env_value(&val, "CAPFORGE_PROJECTION_SEED")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }

        if self.model_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "model_retry_attempts must be at least 1".to_string(),
            ));
        }

        if self.eta_window < 2 {
            return Err(ConfigError::ValidationFailed(
                "eta_window must be at least 2".to_string(),
            ));
        }

        if self.progress_log_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "progress_log_interval must be greater than 0".to_string(),
            ));
        }

        if self.projection_dimension == 0 {
            return Err(ConfigError::ValidationFailed(
                "projection_dimension must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy applied to every registered stage runner.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.model_retry_attempts, self.retry_backoff)
    }

    /// Diversity selector configured by the curation settings.
    pub fn selector(&self) -> DiversitySelector {
        DiversitySelector::new(self.distance_metric).with_strategy(ScoringStrategy::Auto {
            threshold: self.approximate_threshold,
            projection: ProjectionParams {
                dimension: self.projection_dimension,
                seed: self.projection_seed,
            },
        })
    }

    /// Builder method to set max concurrent jobs.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Builder method to set the attempts for model errors.
    pub fn with_model_retry_attempts(mut self, attempts: u32) -> Self {
        self.model_retry_attempts = attempts;
        self
    }

    /// Builder method to set the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Builder method to set the rate smoothing window.
    pub fn with_eta_window(mut self, window: usize) -> Self {
        self.eta_window = window;
        self
    }

    /// Builder method to set the progress log interval.
    pub fn with_progress_log_interval(mut self, interval: Duration) -> Self {
        self.progress_log_interval = interval;
        self
    }

    /// Builder method to set the distance metric.
    pub fn with_distance_metric(mut self, metric: DistanceMetric) -> Self {
        self.distance_metric = metric;
        self
    }

    /// Builder method to set the approximate selection threshold.
    pub fn with_approximate_threshold(mut self, threshold: usize) -> Self {
        self.approximate_threshold = threshold;
        self
    }

    /// Builder method to set the projection dimension and seed.
    pub fn with_projection(mut self, dimension: usize, seed: u64) -> Self {
        self.projection_dimension = dimension;
        self.projection_seed = seed;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
