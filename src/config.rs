//! Engine configuration
//!
//! Defaults for task fan-out, retry and timeouts, plus ssh client options.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`KUBEPIPE_*`)
//! 2. Config file (YAML)
//! 3. Defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connector::SshOptions;
use crate::error::{PipeError, Result};

/// Ceiling on simultaneous per-host workers in a parallel task
pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);
/// Per-attempt action timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_WORK_DIR: &str = "./kubekey";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub retry: u32,
    pub delay_secs: u64,
    pub timeout_secs: u64,
    pub work_dir: PathBuf,
    pub ssh: SshOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: DEFAULT_RETRY,
            delay_secs: DEFAULT_DELAY.as_secs(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            ssh: SshOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    ///
    /// Returns default config if file doesn't exist.
    /// Returns error if file exists but is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| PipeError::InvalidConfig {
            reason: format!("Failed to read {}: {}", path.display(), e),
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| PipeError::InvalidConfig {
            reason: format!("Failed to parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Merge with environment variables
    ///
    /// Environment variables take precedence over config file values.
    /// Unparseable values are rejected rather than ignored.
    pub fn with_env(mut self) -> Result<Self> {
        if let Some(v) = env_parse::<usize>("KUBEPIPE_CONCURRENCY")? {
            self.concurrency = v;
        }
        if let Some(v) = env_parse::<u32>("KUBEPIPE_RETRY")? {
            self.retry = v;
        }
        if let Some(v) = env_parse::<u64>("KUBEPIPE_DELAY_SECS")? {
            self.delay_secs = v;
        }
        if let Some(v) = env_parse::<u64>("KUBEPIPE_TIMEOUT_SECS")? {
            self.timeout_secs = v;
        }
        if let Ok(dir) = std::env::var("KUBEPIPE_WORK_DIR") {
            if !dir.is_empty() {
                self.work_dir = PathBuf::from(dir);
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(PipeError::InvalidConfig {
                reason: "concurrency must be at least 1".to_string(),
            });
        }
        if self.retry == 0 {
            return Err(PipeError::InvalidConfig {
                reason: "retry must be at least 1 (it counts attempts)".to_string(),
            });
        }
        if self.timeout_secs == 0 {
            return Err(PipeError::InvalidConfig {
                reason: "timeoutSecs must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipeError::InvalidConfig {
                reason: format!("{}={}: {}", key, v, e),
            }),
        _ => Ok(None),
    }
}
