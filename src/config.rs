use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{clog_debug, Error, Result};

/// Orchestrator configuration.
///
/// Every constant the core refuses to guess lives here: retry backoff,
/// concurrency defaults, starvation age, timeouts, checkpoint cadence.
/// Loaded from `~/.conductor/conductor.toml`; missing fields fall back
/// to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default per-agent concurrency limit when a descriptor does not set one.
    pub default_concurrency_limit: usize,
    /// Default maximum attempts for a task before Error becomes terminal.
    pub default_max_attempts: u32,
    /// Base delay in milliseconds for exponential retry backoff.
    pub backoff_base_ms: u64,
    /// Cap in milliseconds for exponential retry backoff.
    pub backoff_cap_ms: u64,
    /// Age in seconds after which an unscheduled task is promoted one
    /// priority tier per tick.
    pub starvation_age_secs: u64,
    /// Default worker invocation timeout in seconds, overridable per
    /// capability at registration.
    pub capability_timeout_secs: u64,
    /// Grace period in seconds before a cancelled task is forcibly marked
    /// Cancelled even if the worker ignores its token.
    pub cancel_grace_secs: u64,
    /// Number of completed transitions between automatic checkpoints.
    pub checkpoint_interval: u64,
    /// Bound on each bus subscriber's queue; a full queue blocks publishers.
    pub bus_queue_depth: usize,
    /// Override for the data directory (checkpoints, WAL). Defaults to
    /// `~/.conductor`.
    pub data_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_concurrency_limit: 4,
            default_max_attempts: 3,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
            starvation_age_secs: 30,
            capability_timeout_secs: 300,
            cancel_grace_secs: 5,
            checkpoint_interval: 10,
            bus_queue_depth: 256,
            data_dir: None,
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Resolve the data directory used for checkpoints and the WAL.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::conductor_dir(),
        }
    }

    pub fn checkpoints_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("checkpoints"))
    }

    /// Exponential backoff delay for the given retry attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    pub fn starvation_age(&self) -> Duration {
        Duration::from_secs(self.starvation_age_secs)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.capability_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        clog_debug!(
            "Config loaded: concurrency={}, max_attempts={}, backoff_base_ms={}",
            config.default_concurrency_limit,
            config.default_max_attempts,
            config.backoff_base_ms
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let data_dir = self.data_dir()?;
        let checkpoints = self.checkpoints_dir()?;
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir)?;
        }
        if !checkpoints.exists() {
            fs::create_dir_all(&checkpoints)?;
        }
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
