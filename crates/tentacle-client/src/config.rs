use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backoff::{RetryBackoff, ScriptObserverBackoff};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RpcRetryOptions {
    pub retries_enabled: bool,
    /// Total budget for one call, initial attempt included.
    pub retry_timeout_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_unit_ms: u64,
    pub retry_if_remaining_at_least_ms: u64,
}

impl Default for RpcRetryOptions {
    fn default() -> Self {
        Self {
            retries_enabled: true,
            retry_timeout_secs: 150,
            max_backoff_secs: 10,
            backoff_unit_ms: 1_000,
            retry_if_remaining_at_least_ms: 1_000,
        }
    }
}

impl RpcRetryOptions {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(
            Duration::from_millis(self.backoff_unit_ms),
            self.max_backoff_secs,
        )
    }

    pub fn retry_if_remaining_at_least(&self) -> Duration {
        Duration::from_millis(self.retry_if_remaining_at_least_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PollingOptions {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            max_interval_ms: 5_000,
        }
    }
}

impl PollingOptions {
    pub fn backoff(&self) -> ScriptObserverBackoff {
        ScriptObserverBackoff::new(
            Duration::from_millis(self.interval_ms),
            Duration::from_millis(self.max_interval_ms),
        )
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TentacleClientOptions {
    pub rpc_retry: RpcRetryOptions,
    pub polling: PollingOptions,
    pub cancellation_hard_deadline_secs: u64,
    pub abandon_complete_script_after_secs: u64,
    pub stop_grace_period_secs: u64,
}

impl Default for TentacleClientOptions {
    fn default() -> Self {
        Self {
            rpc_retry: RpcRetryOptions::default(),
            polling: PollingOptions::default(),
            cancellation_hard_deadline_secs: 300,
            abandon_complete_script_after_secs: 60,
            stop_grace_period_secs: 10,
        }
    }
}

impl TentacleClientOptions {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn cancellation_hard_deadline(&self) -> Duration {
        Duration::from_secs(self.cancellation_hard_deadline_secs)
    }

    pub fn abandon_complete_script_after(&self) -> Duration {
        Duration::from_secs(self.abandon_complete_script_after_secs)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }
}
