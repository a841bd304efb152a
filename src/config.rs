//! Process-wide configuration
//!
//! Read once at startup from `config/bot.yaml` (or the file named by
//! `WARDEN_CONFIG`). Per-guild settings live separately, see `data`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the config file
pub const CONFIG_FILE: &str = "config/bot.yaml";
/// Environment variable overriding `CONFIG_FILE`
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Cadence and time bound for one feature's sweeper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSchedule {
    /// Seconds between ticks
    pub interval_secs: u64,
    /// Seconds a single handler may run before the record is retried
    pub handler_timeout_secs: u64,
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self::every(60)
    }
}

impl SweepSchedule {
    #[must_use]
    pub const fn every(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            handler_timeout_secs: 10,
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

/// Sweep cadence per feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub temp_bans: SweepSchedule,
    pub temp_mutes: SweepSchedule,
    pub reminders: SweepSchedule,
    pub giveaways: SweepSchedule,
    pub event_reminders: SweepSchedule,
    pub birthdays: SweepSchedule,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            temp_bans: SweepSchedule::every(60),
            temp_mutes: SweepSchedule::every(60),
            reminders: SweepSchedule::every(30),
            giveaways: SweepSchedule::every(30),
            event_reminders: SweepSchedule::every(1800),
            birthdays: SweepSchedule::every(3600),
        }
    }
}

impl SweepConfig {
    fn named(&self) -> [(&'static str, &SweepSchedule); 6] {
        [
            ("temp_bans", &self.temp_bans),
            ("temp_mutes", &self.temp_mutes),
            ("reminders", &self.reminders),
            ("giveaways", &self.giveaways),
            ("event_reminders", &self.event_reminders),
            ("birthdays", &self.birthdays),
        ]
    }
}

/// Top-level bot configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Root for timer files and guild settings
    pub data_dir: PathBuf,
    pub sweeps: SweepConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            sweeps: SweepConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load from `WARDEN_CONFIG` or `CONFIG_FILE`
    ///
    /// # Errors
    /// See `load_from`
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).map_or_else(|_| PathBuf::from(CONFIG_FILE), PathBuf::from);
        Self::load_from(&path).await
    }

    /// Load and validate a config file; a missing file yields the defaults
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the result fails `validate`
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Self::default(),
            Ok(content) => serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make a sweeper spin or never time out
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first bad schedule
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, schedule) in self.sweeps.named() {
            if schedule.interval_secs == 0 {
                return Err(ConfigError::Invalid(format!("sweeps.{name}.interval_secs must be > 0")));
            }
            if schedule.handler_timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "sweeps.{name}.handler_timeout_secs must be > 0"
                )));
            }
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// Directory holding one YAML file per timer namespace
    #[must_use]
    pub fn timers_dir(&self) -> PathBuf {
        self.data_dir.join("timers")
    }

    /// Directory holding one YAML file per guild
    #[must_use]
    pub fn guilds_dir(&self) -> PathBuf {
        self.data_dir.join("guilds")
    }
}
