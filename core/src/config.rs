//! TOML configuration for the bridge binary.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const API_TOKEN_ENV: &str = "BRIDGE_API_TOKEN";

const DEFAULT_API_URL: &str = "https://api.linear.app/graphql";
const DEFAULT_SOURCE: &str = "linear";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_RATE_MAX_REQUESTS: usize = 500;
const DEFAULT_RATE_WINDOW_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: usize,
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_MAX_REQUESTS,
            window_secs: DEFAULT_RATE_WINDOW_SECS,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// One configured engine: the command line spawned per run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineCommand {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Overridden by `BRIDGE_API_TOKEN` when set.
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub queue_url: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub default_engine: Option<String>,
    /// Remote project id to local project key.
    #[serde(default)]
    pub projects: HashMap<String, String>,
    #[serde(default)]
    pub engines: HashMap<String, EngineCommand>,
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Ok(token) = std::env::var(API_TOKEN_ENV)
            && !token.is_empty()
        {
            config.api_token = token;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_token.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: format!("api_token is empty (set it in the file or via {API_TOKEN_ENV})"),
            });
        }
        if !self.queue_url.starts_with("postgres://") && !self.queue_url.starts_with("postgresql://")
        {
            return Err(ConfigError::Invalid {
                reason: "queue_url must be a postgres:// or postgresql:// URL".to_string(),
            });
        }
        if let Some(engine) = self.default_engine.as_deref()
            && !self.engines.contains_key(engine)
        {
            return Err(ConfigError::Invalid {
                reason: format!("default_engine {engine:?} has no [engines.{engine}] entry"),
            });
        }
        for (name, engine) in &self.engines {
            if engine.command.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("engine {name:?} has an empty command"),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_source() -> String {
    DEFAULT_SOURCE.to_string()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_rate_max_requests() -> usize {
    DEFAULT_RATE_MAX_REQUESTS
}

fn default_rate_window_secs() -> u64 {
    DEFAULT_RATE_WINDOW_SECS
}
