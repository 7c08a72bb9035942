//! Daemon configuration: file-backed defaults with validation.
//!
//! Configuration is a JSON file (all fields optional, falling back to
//! defaults) plus whatever the binary's CLI flags override. Values are
//! validated up front so a bad config fails at startup, not mid-run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::{RateLimit, RateLimiter};
use crate::model::RequestClass;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the config file failed.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for the schema.
    #[error("failed to parse config file {path}: {message}")]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A value is outside its allowed range.
    #[error("invalid config value for `{field}`: {message}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// One request class's rolling-window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum request starts per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimitConfig {
    fn as_limit(self) -> RateLimit {
        RateLimit::new(self.max_requests, Duration::from_millis(self.window_ms))
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Scheduler tick period in milliseconds.
    pub tick_interval_ms: u64,
    /// Root directory for chapter archives.
    pub output_dir: PathBuf,
    /// Directory for cached cover images.
    pub cover_dir: PathBuf,
    /// Fetch attempts per request (including the first).
    pub max_fetch_attempts: u32,
    /// Per-provider budget for fan-out searches, in seconds.
    pub search_timeout_secs: u64,
    /// Budget for request classes without an explicit entry.
    pub default_rate_limit: RateLimitConfig,
    /// Per-class budgets, keyed by request class name
    /// ("metadata", "feed", "cover_image", "page_image", "default").
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Default chapter cutoff applied to newly added manga.
    pub ignore_chapters_before: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            output_dir: PathBuf::from("downloads"),
            cover_dir: PathBuf::from("covers"),
            max_fetch_attempts: 3,
            search_timeout_secs: 30,
            default_rate_limit: RateLimitConfig {
                max_requests: 4,
                window_ms: 1000,
            },
            rate_limits: HashMap::new(),
            ignore_chapters_before: 0.0,
        }
    }
}

impl Config {
    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, [`ConfigError::Parse`]
    /// for malformed JSON or unknown fields, [`ConfigError::Invalid`] for
    /// out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges and rate-limit class names.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tick_interval_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_fetch_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_fetch_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if self.default_rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "default_rate_limit",
                message: "window_ms must be greater than zero".to_string(),
            });
        }
        for (name, limit) in &self.rate_limits {
            if name.parse::<RequestClass>().is_err() {
                return Err(ConfigError::Invalid {
                    field: "rate_limits",
                    message: format!("unknown request class: {name}"),
                });
            }
            if limit.window_ms == 0 {
                return Err(ConfigError::Invalid {
                    field: "rate_limits",
                    message: format!("window_ms for {name} must be greater than zero"),
                });
            }
        }
        if !self.ignore_chapters_before.is_finite() || self.ignore_chapters_before < 0.0 {
            return Err(ConfigError::Invalid {
                field: "ignore_chapters_before",
                message: "must be a non-negative number".to_string(),
            });
        }
        Ok(())
    }

    /// Builds the shared rate limiter from the configured budgets.
    ///
    /// Call only after [`validate`](Self::validate): unknown class names are
    /// skipped here.
    #[must_use]
    pub fn build_rate_limiter(&self) -> RateLimiter {
        let limiter = RateLimiter::new(self.default_rate_limit.as_limit());
        for (name, limit) in &self.rate_limits {
            if let Ok(class) = name.parse::<RequestClass>() {
                limiter.set_limit(class, limit.as_limit());
            }
        }
        limiter
    }

    /// Scheduler tick period.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Per-provider fan-out search budget.
    #[must_use]
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}
