use std::{
    collections::BTreeMap,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::clock::{Clock, SystemClock};
use crate::config::BotConfig;
use crate::discord::{GuildNotifier, GuildOps, OpsMitigator};
use crate::features::FeatureStores;
use crate::queue::TimedActionQueue;
use crate::raid::{RaidDetector, RaidSettings};
use crate::timed::{StoreError, StoreResult};
use crate::SETTINGS_TARGET;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Default birthday announcement; `{user}` is replaced by a mention
pub const DEFAULT_BIRTHDAY_MESSAGE: &str = "🎂 Happy Birthday {user}! 🎉";

/// Birthday announcements for one guild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BirthdaySettings {
    pub enabled: bool,
    pub channel_id: Option<u64>,
    /// Role granted on the day
    pub role_id: Option<u64>,
    pub message: String,
    /// user id -> `MM-DD`
    pub dates: BTreeMap<u64, String>,
}

impl Default for BirthdaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_id: None,
            role_id: None,
            message: DEFAULT_BIRTHDAY_MESSAGE.to_string(),
            dates: BTreeMap::new(),
        }
    }
}

impl BirthdaySettings {
    #[must_use]
    pub fn render(&self, user_id: u64) -> String {
        self.message.replace("{user}", &format!("<@{user_id}>"))
    }
}

/// Per-guild configuration, stored as `<guild_id>.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    pub guild_id: u64,
    /// Where moderation notices and raid alerts go
    pub log_channel_id: Option<u64>,
    pub muted_role_id: Option<u64>,
    pub raid: RaidSettings,
    pub birthdays: BirthdaySettings,
}

impl GuildSettings {
    #[must_use]
    pub fn for_guild(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct SettingsInner {
    dir: Option<PathBuf>,
    guilds: DashMap<u64, GuildSettings>,
    locks: DashMap<u64, Arc<Mutex<()>>>,
}

/// Guild settings, one file per guild
///
/// Each guild is written under its own lock, so concurrent updates to
/// different guilds never contend and never clobber each other's file.
#[derive(Clone, Default)]
pub struct GuildSettingsStore {
    inner: Arc<SettingsInner>,
}

impl std::fmt::Debug for GuildSettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildSettingsStore")
            .field("dir", &self.inner.dir)
            .field("guilds", &self.inner.guilds.len())
            .finish()
    }
}

impl GuildSettingsStore {
    /// Settings that are never written to disk
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load every `*.yaml` file in `dir`
    ///
    /// Unreadable files are logged and skipped so one bad guild cannot keep
    /// the bot from starting.
    ///
    /// # Errors
    /// Returns `StoreError::InvalidRecord` if `dir` is not valid UTF-8
    pub async fn load(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        let pattern = dir.join("*.yaml");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| StoreError::InvalidRecord(format!("non UTF-8 path {}", dir.display())))?;

        let guilds = DashMap::new();
        let paths = glob::glob(pattern).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        for path in paths.flatten() {
            match read_settings(&path).await {
                Ok(settings) => {
                    guilds.insert(settings.guild_id, settings);
                }
                Err(e) => warn!(
                    target: SETTINGS_TARGET,
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable guild settings"
                ),
            }
        }

        info!(target: SETTINGS_TARGET, guilds = guilds.len(), "Guild settings loaded");
        Ok(Self {
            inner: Arc::new(SettingsInner {
                dir: Some(dir.to_path_buf()),
                guilds,
                locks: DashMap::new(),
            }),
        })
    }

    /// Settings for a guild, defaults if it never configured anything
    #[must_use]
    pub fn get(&self, guild_id: u64) -> GuildSettings {
        self.inner
            .guilds
            .get(&guild_id)
            .map_or_else(|| GuildSettings::for_guild(guild_id), |s| s.value().clone())
    }

    /// Apply a change to one guild and persist it
    ///
    /// # Errors
    /// Returns the write error; the previous settings then stay in effect
    pub async fn update<F>(&self, guild_id: u64, change: F) -> StoreResult<GuildSettings>
    where
        F: FnOnce(&mut GuildSettings) + Send,
    {
        let lock = self.inner.locks.entry(guild_id).or_default().clone();
        let _guard = lock.lock().await;

        let mut settings = self.get(guild_id);
        change(&mut settings);
        settings.guild_id = guild_id;

        if let Some(dir) = &self.inner.dir {
            write_settings(dir, &settings).await?;
        }
        self.inner.guilds.insert(guild_id, settings.clone());
        Ok(settings)
    }

    /// Guilds with stored settings
    #[must_use]
    pub fn guild_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.guilds.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

async fn read_settings(path: &Path) -> StoreResult<GuildSettings> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut settings: GuildSettings =
        serde_yaml::from_str(&content).map_err(|e| StoreError::Deserialize(e.to_string()))?;
    if settings.guild_id == 0 {
        settings.guild_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::InvalidRecord(format!("no guild id for {}", path.display())))?;
    }
    Ok(settings)
}

async fn write_settings(dir: &Path, settings: &GuildSettings) -> StoreResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    let yaml = serde_yaml::to_string(settings).map_err(|e| StoreError::Serialize(e.to_string()))?;
    let path = dir.join(format!("{}.yaml", settings.guild_id));
    let tmp = dir.join(format!("{}.yaml.tmp", settings.guild_id));
    tokio::fs::write(&tmp, yaml).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Centralized data structure for the bot
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.config)
            .field("guilds", &self.guilds)
            .field("stores", &self.stores)
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Shared bot state handed to commands and event handlers
pub struct DataInner {
    pub config: BotConfig,
    pub guilds: GuildSettingsStore,
    pub stores: FeatureStores,
    pub raid: RaidDetector,
    /// Off-path writer for timer records
    pub queue: TimedActionQueue,
    pub ops: Arc<dyn GuildOps>,
    pub clock: Arc<dyn Clock>,
}

impl Data {
    /// Wire up shared state around already-opened stores
    ///
    /// Spawns the action queue worker, so this must run inside a tokio runtime.
    #[must_use]
    pub fn new(
        config: BotConfig,
        guilds: GuildSettingsStore,
        stores: FeatureStores,
        ops: Arc<dyn GuildOps>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let raid = RaidDetector::new(
            Arc::new(OpsMitigator::new(Arc::clone(&ops))),
            Arc::new(GuildNotifier::new(Arc::clone(&ops), guilds.clone())),
        );
        let queue = TimedActionQueue::spawn(stores.clone());
        Self(Arc::new(DataInner {
            config,
            guilds,
            stores,
            raid,
            queue,
            ops,
            clock,
        }))
    }

    /// Load guild settings and timer stores from `config.data_dir`
    ///
    /// # Errors
    /// Returns the first store that fails to open
    pub async fn load(config: BotConfig, ops: Arc<dyn GuildOps>) -> StoreResult<Self> {
        let guilds = GuildSettingsStore::load(config.guilds_dir()).await?;
        let stores = FeatureStores::open(config.timers_dir()).await?;
        Ok(Self::new(config, guilds, stores, ops, Arc::new(SystemClock)))
    }

    /// State held only in memory
    #[must_use]
    pub fn in_memory(ops: Arc<dyn GuildOps>, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            BotConfig::default(),
            GuildSettingsStore::in_memory(),
            FeatureStores::in_memory(),
            ops,
            clock,
        )
    }

    /// Settings for a guild
    #[must_use]
    pub fn guild_settings(&self, guild_id: u64) -> GuildSettings {
        self.guilds.get(guild_id)
    }
}
