//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::ratelimit::RateLimitConfig;

/// Prefix of environment variables that override file settings, e.g.
/// `GATEKEEPER__LOG__LEVEL=debug`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML rate limit rules file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Rules given inline; ignored when `rules_path` is set
    #[serde(default)]
    pub rules: Option<RateLimitConfig>,
}

impl GatekeeperConfig {
    /// Load configuration from an optional file, overridden by
    /// `GATEKEEPER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = ::config::Config::builder()
            .add_source(::config::File::from_str(yaml, ::config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// The validated rate limit rules this configuration points at.
    pub fn rate_limits(&self) -> Result<RateLimitConfig> {
        let rules = match (&self.rate_limiting.rules_path, &self.rate_limiting.rules) {
            (Some(path), _) => RateLimitConfig::from_file(path)?,
            (None, Some(rules)) => rules.clone(),
            (None, None) => RateLimitConfig::default(),
        };
        rules.validate()?;
        Ok(rules)
    }
}
