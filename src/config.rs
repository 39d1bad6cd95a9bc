use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::retry::{
    BackoffPolicy, RetryPolicy, DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS,
    DEFAULT_BACKOFF_MULTIPLIER,
};
use crate::{Error, Result};

pub const DEFAULT_EVENT_BUFFER: usize = 256;

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Extra retries allowed on the fallback agent.
    #[serde(default)]
    pub fallback_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            fallback_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Alert policy documents in load order; later files win.
    #[serde(default)]
    pub policy_files: Vec<String>,
    /// Directory for plan snapshots. Unset keeps state in memory only.
    pub persist_dir: Option<String>,
    /// Capacity of the scheduler event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            policy_files: Vec::new(),
            persist_dir: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Config {
    pub fn baton_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".baton"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::baton_dir()?.join("baton.toml"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffPolicy::exponential(
                Duration::from_millis(self.retry.backoff_initial_ms),
                self.retry.backoff_multiplier,
                Duration::from_millis(self.retry.backoff_max_ms),
            ),
            fallback_retries: self.retry.fallback_retries,
        }
    }

    pub fn policy_paths(&self) -> Vec<PathBuf> {
        self.policy_files.iter().map(|p| expand_tilde(p)).collect()
    }

    pub fn persist_path(&self) -> Option<PathBuf> {
        self.persist_dir.as_deref().map(expand_tilde)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Config::load path={}", path.display());
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            "Config loaded: policy_files={:?}, persist_dir={:?}, fallback_retries={}",
            config.policy_files, config.persist_dir, config.retry.fallback_retries
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let baton_dir = Self::baton_dir()?;
        if !baton_dir.exists() {
            debug!("Creating baton directory: {}", baton_dir.display());
            fs::create_dir_all(&baton_dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
