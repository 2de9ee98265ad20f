//! Engine configuration
//!
//! [`EngineConfig`] is plain data with serde support. Files are loaded by
//! extension (`.toml`, `.yaml`/`.yml`) and validated before use.

use std::path::Path;

use crate::retry::RetryConfig;

/// What happens when the retry budget of a rollout is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop in `FailedAndPause` until resumed or re-triggered
    #[default]
    Pause,
    /// Wait a backoff in `FailedAndRetry`, then start a new round
    Retry,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rollout retry budget and backoff
    pub retry: RetryConfig,
    /// Default failure policy (items may override)
    pub failure_policy: FailurePolicy,
    /// Instances applied concurrently per rollout
    pub dispatch_concurrency: usize,
    /// Commands queued per item worker
    pub command_buffer: usize,
    /// Transition log entries kept per item
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            failure_policy: FailurePolicy::Pause,
            dispatch_concurrency: 16,
            command_buffer: 64,
            history_limit: 64,
        }
    }
}

impl EngineConfig {
    /// Create with defaults
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set retry configuration
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set default failure policy
    #[inline]
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set dispatch concurrency
    #[inline]
    #[must_use]
    pub fn with_dispatch_concurrency(mut self, concurrency: usize) -> Self {
        self.dispatch_concurrency = concurrency;
        self
    }

    /// Set per-item command queue size
    #[inline]
    #[must_use]
    pub fn with_command_buffer(mut self, size: usize) -> Self {
        self.command_buffer = size;
        self
    }

    /// Set transition log length
    #[inline]
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.dispatch_concurrency == 0 {
            return invalid("dispatch_concurrency", "must be at least 1");
        }
        if self.command_buffer == 0 {
            return invalid("command_buffer", "must be at least 1");
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier", "must be a finite number >= 1.0");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return invalid("retry.max_backoff_ms", "must not be below retry.initial_backoff_ms");
        }
        Ok(())
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML or fails validation
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML
    ///
    /// # Errors
    /// Returns error if the text is not valid YAML or fails validation
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, has an unknown extension,
    /// does not parse, or fails validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid TOML
    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid YAML
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Unknown file extension
    #[error("unsupported config format '{0}' (expected toml, yaml or yml)")]
    UnsupportedFormat(String),

    /// Value out of range
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.failure_policy, FailurePolicy::Pause);
        assert_eq!(config.dispatch_concurrency, 16);
        assert_eq!(config.command_buffer, 64);
        assert_eq!(config.history_limit, 64);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            "failure_policy = \"retry\"\n[retry]\nmax_attempts = 5\n",
        )
        .unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Retry);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.retry_interval_ms, 1_000);
        assert_eq!(config.dispatch_concurrency, 16);
    }

    #[test]
    fn yaml_is_accepted() {
        let config =
            EngineConfig::from_yaml_str("dispatch_concurrency: 4\nretry:\n  backoff_multiplier: 1.5\n")
                .unwrap();
        assert_eq!(config.dispatch_concurrency, 4);
        assert!((config.retry.backoff_multiplier - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = EngineConfig::from_toml_str("dispatch_concurrency = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "dispatch_concurrency",
                ..
            }
        ));
    }

    #[test]
    fn shrinking_multiplier_rejected() {
        let config = EngineConfig::new()
            .with_retry(RetryConfig::default().with_backoff_multiplier(0.5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "retry.backoff_multiplier",
                ..
            })
        ));
    }

    #[test]
    fn load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "command_buffer: 8").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().command_buffer, 8);

        let bad = dir.path().join("engine.ini");
        std::fs::write(&bad, "x=1").unwrap();
        assert!(matches!(
            EngineConfig::load(&bad),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
