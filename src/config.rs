use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{mlog_debug, Error, Result};

/// Daemon configuration, loaded from `~/.marshal/marshal.toml`.
///
/// Every field has a default so a missing config file is equivalent to an
/// empty one. Durations are stored as whole seconds in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Minimum log level (`error`..`trace`); `--debug` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How often the dispatch loop wakes to look for due tasks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Window within which a second enqueue for the same target is a duplicate.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// First retry delay; doubles per retry.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    /// Ceiling for the exponential backoff delay.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Default retry budget for newly enqueued tasks.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// How long a live but unchanging target may idle before it is flagged.
    #[serde(default = "default_phantom_grace_secs")]
    pub phantom_grace_secs: u64,
    /// Recovery dispatches allowed per project within the breaker window.
    #[serde(default = "default_breaker_max_recoveries")]
    pub breaker_max_recoveries: usize,
    /// Rolling window for the recovery circuit breaker.
    #[serde(default = "default_breaker_window_secs")]
    pub breaker_window_secs: u64,
    /// Lease duration for dispatch locks.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Bound on a single agent-messaging send.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// How long the notification router waits for an acknowledgement.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Reschedules of one target within the rapid window that count as a loop.
    #[serde(default = "default_rapid_threshold")]
    pub rapid_reschedule_threshold: usize,
    /// Rolling window for rapid-reschedule detection.
    #[serde(default = "default_rapid_window_secs")]
    pub rapid_window_secs: u64,
    /// Consecutive identical intervals that count as a fixed-interval loop.
    #[serde(default = "default_fixed_interval_threshold")]
    pub fixed_interval_threshold: usize,
    /// Emergency/recovery alternations that count as an oscillation.
    #[serde(default = "default_oscillation_threshold")]
    pub oscillation_threshold: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_dedup_window_secs() -> u64 {
    60
}
fn default_base_delay_secs() -> u64 {
    10
}
fn default_max_delay_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_phantom_grace_secs() -> u64 {
    900
}
fn default_breaker_max_recoveries() -> usize {
    3
}
fn default_breaker_window_secs() -> u64 {
    1800
}
fn default_lock_ttl_secs() -> u64 {
    120
}
fn default_send_timeout_secs() -> u64 {
    15
}
fn default_ack_timeout_secs() -> u64 {
    120
}
fn default_rapid_threshold() -> usize {
    5
}
fn default_rapid_window_secs() -> u64 {
    300
}
fn default_fixed_interval_threshold() -> usize {
    3
}
fn default_oscillation_threshold() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        // Round-trip through an empty table so serde's field defaults apply.
        toml::from_str("").unwrap_or_else(|_| unreachable!("empty config must parse"))
    }
}

impl Config {
    pub fn marshal_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".marshal"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::marshal_dir()?.join("marshal.toml"))
    }

    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::marshal_dir()?.join("marshal.db"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, writing defaults");
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        mlog_debug!(
            "Config loaded: poll={}s dedup={}s base_delay={}s max_retries={}",
            config.poll_interval_secs,
            config.dedup_window_secs,
            config.base_delay_secs,
            config.default_max_retries
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::marshal_dir()?;
        mlog_debug!("Config::save dir={}", dir.display());
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::marshal_dir()?;
        if !dir.exists() {
            mlog_debug!("Creating marshal directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedup_window_secs as i64)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn phantom_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.phantom_grace_secs as i64)
    }

    pub fn breaker_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.breaker_window_secs as i64)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn rapid_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.rapid_window_secs as i64)
    }

    pub fn log_level(&self) -> Result<crate::log::LogLevel> {
        self.log_level.parse()
    }
}
