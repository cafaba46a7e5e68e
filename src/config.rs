//! `yard.toml` configuration

use crate::paths;
use anyhow::{Context, Result, bail};
use converge::{ExecuteOptions, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level yard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct YardConfig {
    /// State file location; `~` and `$VARS` are expanded
    pub state_file: Option<String>,

    /// Worker threads per level
    pub jobs: usize,

    /// Resource types that must run one at a time within a level
    pub serial_types: Vec<String>,

    /// Retry policy for retryable provider failures
    pub retry: RetrySettings,
}

impl Default for YardConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            jobs: 4,
            serial_types: Vec::new(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            backoff_factor: settings.backoff_factor,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl YardConfig {
    /// Load config from an explicit path, or the default location
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => {
                let path = paths::config_file()?;
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    log::debug!("No config at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let factor = self.retry.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            bail!("retry.backoff_factor must be a finite number >= 1.0 (got {factor})");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        Ok(())
    }

    /// Resolve the state file, with a command-line override taking priority
    pub fn state_path(&self, cli_override: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = cli_override {
            return Ok(path.to_path_buf());
        }
        match &self.state_file {
            Some(configured) => Ok(paths::expand(configured)),
            None => paths::state_file(),
        }
    }

    /// Engine options, with a command-line job count taking priority
    pub fn execute_options(&self, jobs: Option<usize>) -> ExecuteOptions {
        ExecuteOptions {
            jobs: jobs.unwrap_or(self.jobs).max(1),
            retry: RetryConfig::from(&self.retry),
        }
    }
}
