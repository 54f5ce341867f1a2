//! Engine Configuration
//!
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `ENCC_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ENCC_VALUE_ENVIRONMENTS` | Allow value-type environments for non-escaping closures | true |
//! | `ENCC_MERGE_SCOPES` | Merge environments of adjacent scopes | true |
//! | `ENCC_ANALYSIS_THREADS` | Worker threads for per-method analysis | CPU count |
//! | `ENCC_REMINT_ON_STATIC_TO_INSTANCE` | Give a closure a new identity when it stops being static | true |
//! | `ENCC_LOG_LEVEL` | Default log level for the `encc` target | info |
//!
//! # Example
//!
//! ```rust
//! use encc::config::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .analysis_threads(2)
//!     .value_environments(false)
//!     .build()
//!     .unwrap();
//! assert!(!config.environments.value_environments);
//! ```

use std::env;
use std::str::FromStr;

use thiserror::Error;

use crate::closure::HostClass;
use crate::delta::{ReuseAction, ReusePolicy};
use crate::diagnostics::ErrorCode;

/// Upper bound on analysis worker threads.
pub const MAX_ANALYSIS_THREADS: usize = 64;

/// Log level for the engine's `tracing` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Filter directive for subscribers that have no explicit filter, e.g.
    /// `encc=debug`.
    pub fn directive(&self) -> String {
        format!("encc={}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Ok(LogLevel::Off),
            "error" | "err" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            other => Err(ConfigError::EnvParse {
                var: "ENCC_LOG_LEVEL".into(),
                message: format!("unknown log level `{}`", other),
            }),
        }
    }
}

/// Per-method analysis configuration.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Worker threads used to analyze the methods of one edit.
    /// Default: number of available CPUs, capped at [`MAX_ANALYSIS_THREADS`].
    pub threads: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus().min(MAX_ANALYSIS_THREADS),
        }
    }
}

/// Environment layout configuration.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Lay out environments used only by non-escaping closures as values.
    /// Default: true.
    pub value_environments: bool,

    /// Collapse a scope's environment into its nearest ancestor environment
    /// when that never adds a capture.
    /// Default: true.
    pub merge_scopes: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            value_environments: true,
            merge_scopes: true,
        }
    }
}

/// Cross-generation matching configuration.
#[derive(Debug, Clone, Default)]
pub struct MatchingConfig {
    /// What to do when a closure's host class changes across an edit.
    pub policy: ReusePolicy,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when the subscriber has no explicit filter.
    /// Default: Info.
    pub level: LogLevel,

    /// Emit one event per classified entity.
    /// Default: true.
    pub entity_reports: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            entity_reports: true,
        }
    }
}

/// Complete engine configuration.
///
/// Use `EngineConfig::default()` for sensible defaults, or
/// `EngineConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub analysis: AnalysisConfig,
    pub environments: EnvironmentConfig,
    pub matching: MatchingConfig,
    pub log: LogConfig,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("ENCC_ANALYSIS_THREADS") {
            if (1..=MAX_ANALYSIS_THREADS).contains(&val) {
                config.analysis.threads = val;
            }
        }

        if let Some(val) = parse_env_bool("ENCC_VALUE_ENVIRONMENTS") {
            config.environments.value_environments = val;
        }

        if let Some(val) = parse_env_bool("ENCC_MERGE_SCOPES") {
            config.environments.merge_scopes = val;
        }

        if let Some(remint) = parse_env_bool("ENCC_REMINT_ON_STATIC_TO_INSTANCE") {
            let action = if remint {
                ReuseAction::Remint
            } else {
                ReuseAction::Reuse
            };
            for new in [HostClass::TypeInstance, HostClass::Environment] {
                config.matching.policy.set(HostClass::Singleton, new, action);
            }
        }

        if let Ok(val) = env::var("ENCC_LOG_LEVEL") {
            if let Ok(level) = val.parse() {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.analysis.threads == 0 || self.analysis.threads > MAX_ANALYSIS_THREADS {
            return Err(ConfigError::InvalidValue {
                field: "analysis.threads".into(),
                message: format!("must be between 1 and {}", MAX_ANALYSIS_THREADS),
            });
        }

        for class in HostClass::ALL {
            if self.matching.policy.action(class, class) != ReuseAction::Reuse {
                return Err(ConfigError::InvalidValue {
                    field: "matching.policy".into(),
                    message: format!("{} -> {} must reuse the existing identity", class, class),
                });
            }
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParse { var: String, message: String },
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidConfig
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analysis_threads(mut self, threads: usize) -> Self {
        self.config.analysis.threads = threads;
        self
    }

    pub fn value_environments(mut self, enabled: bool) -> Self {
        self.config.environments.value_environments = enabled;
        self
    }

    pub fn merge_scopes(mut self, enabled: bool) -> Self {
        self.config.environments.merge_scopes = enabled;
        self
    }

    /// Replace the whole reuse policy table.
    pub fn policy(mut self, policy: ReusePolicy) -> Self {
        self.config.matching.policy = policy;
        self
    }

    /// Override a single host transition.
    pub fn transition(mut self, old: HostClass, new: HostClass, action: ReuseAction) -> Self {
        self.config.matching.policy.set(old, new, action);
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    pub fn entity_reports(mut self, enabled: bool) -> Self {
        self.config.log.entity_reports = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> EngineConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
