//! Anti-raid join-rate detection
//!
//! Joins are counted per guild in a sliding window. When the count reaches the
//! guild's threshold the detector fires once, hands the most recent joiners to
//! the configured mitigation, then re-arms by clearing the window.

use crate::RAID_TARGET;
use crate::window::WindowCounter;
use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Longest window a guild can configure (one day)
const MAX_WINDOW_SECS: u64 = 86_400;

/// What to do with the members caught in a raid burst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidAction {
    #[default]
    #[display("kick")]
    Kick,
    #[display("ban")]
    Ban,
    /// Alert (and optionally lock down) without touching members
    #[display("none")]
    None,
}

impl std::str::FromStr for RaidAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kick" => Ok(Self::Kick),
            "ban" => Ok(Self::Ban),
            "none" => Ok(Self::None),
            other => Err(format!("unknown raid action '{other}', expected kick, ban or none")),
        }
    }
}

/// Per-guild anti-raid configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaidSettings {
    pub enabled: bool,
    /// Joins within the window that count as a raid
    pub join_threshold: u32,
    /// Window length in seconds
    pub time_window: u64,
    pub action: RaidAction,
    pub lockdown_on_raid: bool,
}

impl Default for RaidSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            join_threshold: 10,
            time_window: 10,
            action: RaidAction::Kick,
            lockdown_on_raid: true,
        }
    }
}

impl RaidSettings {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::seconds(i64::try_from(self.time_window.min(MAX_WINDOW_SECS)).unwrap_or(0))
    }

    #[must_use]
    pub fn alert_message(&self) -> String {
        format!(
            "🚨 RAID DETECTED! **{}** users joined in **{}** seconds! Action taken: **{}**",
            self.join_threshold,
            self.time_window,
            self.action.to_string().to_uppercase()
        )
    }
}

/// Failure delivering a message to a guild
#[derive(Debug, Error)]
#[error("Notification to guild {guild_id} failed: {reason}")]
pub struct NotifyError {
    pub guild_id: u64,
    pub reason: String,
}

/// Failure applying a mitigation
#[derive(Debug, Error)]
pub enum MitigationError {
    #[error("Member {user_id} could not be actioned: {reason}")]
    Member { user_id: u64, reason: String },

    #[error("Lockdown of guild {guild_id} failed: {reason}")]
    Lockdown { guild_id: u64, reason: String },
}

/// Outbound notification channel for a guild
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait NotifySink: Send + Sync {
    async fn send(&self, guild_id: u64, message: &str) -> Result<(), NotifyError>;
}

/// Applies raid mitigation against the chat platform
#[async_trait::async_trait]
pub trait Mitigator: Send + Sync {
    /// Kick or ban a single member
    async fn act_on_member(
        &self,
        guild_id: u64,
        user_id: u64,
        action: RaidAction,
    ) -> Result<(), MitigationError>;

    /// Lock every text channel in the guild, returning how many were locked
    async fn lockdown(&self, guild_id: u64) -> Result<usize, MitigationError>;
}

/// Outcome of a detected raid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidReport {
    pub guild_id: u64,
    /// Members matched, most recent join first
    pub members: Vec<u64>,
    pub action: RaidAction,
    /// Members the mitigation failed for
    pub failed: Vec<u64>,
    pub locked_down: bool,
    pub alerted: bool,
}

/// Join-rate raid detector
pub struct RaidDetector {
    joins: WindowCounter<u64, u64>,
    mitigator: Arc<dyn Mitigator>,
    notifier: Arc<dyn NotifySink>,
}

impl RaidDetector {
    pub fn new(mitigator: Arc<dyn Mitigator>, notifier: Arc<dyn NotifySink>) -> Self {
        Self {
            joins: WindowCounter::new(),
            mitigator,
            notifier,
        }
    }

    /// Handle a member join
    ///
    /// Returns a report when this join completed a raid burst. Disabled guilds
    /// are ignored entirely, including window bookkeeping.
    pub async fn on_join(
        &self,
        guild_id: u64,
        user_id: u64,
        at: DateTime<Utc>,
        settings: &RaidSettings,
    ) -> Option<RaidReport> {
        if !settings.enabled {
            return None;
        }

        let threshold = usize::try_from(settings.join_threshold).unwrap_or(usize::MAX);
        let members =
            self.joins
                .record_and_trip(guild_id, at, user_id, settings.window(), threshold)?;

        warn!(
            target: RAID_TARGET,
            guild_id = %guild_id,
            joins = members.len(),
            window_secs = settings.time_window,
            action = %settings.action,
            "Raid detected"
        );

        Some(self.mitigate(guild_id, members, settings).await)
    }

    /// Recent joins currently held for a guild
    pub fn pending_joins(&self, guild_id: u64, now: DateTime<Utc>, settings: &RaidSettings) -> usize {
        self.joins.count(&guild_id, now, settings.window())
    }

    /// Forget the join history of a guild
    pub fn reset(&self, guild_id: u64) {
        self.joins.reset(&guild_id);
    }

    async fn mitigate(&self, guild_id: u64, members: Vec<u64>, settings: &RaidSettings) -> RaidReport {
        let alerted = match self.notifier.send(guild_id, &settings.alert_message()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: RAID_TARGET, guild_id = %guild_id, error = %e, "Raid alert not delivered");
                false
            }
        };

        let mut failed = Vec::new();
        if settings.action != RaidAction::None {
            for user_id in &members {
                if let Err(e) = self
                    .mitigator
                    .act_on_member(guild_id, *user_id, settings.action)
                    .await
                {
                    warn!(
                        target: RAID_TARGET,
                        guild_id = %guild_id,
                        user_id = %user_id,
                        error = %e,
                        "Raid mitigation failed for member"
                    );
                    failed.push(*user_id);
                }
            }
        }

        let locked_down = if settings.lockdown_on_raid {
            match self.mitigator.lockdown(guild_id).await {
                Ok(channels) => {
                    info!(target: RAID_TARGET, guild_id = %guild_id, channels, "Guild locked down");
                    true
                }
                Err(e) => {
                    warn!(target: RAID_TARGET, guild_id = %guild_id, error = %e, "Raid lockdown failed");
                    false
                }
            }
        } else {
            false
        };

        RaidReport {
            guild_id,
            members,
            action: settings.action,
            failed,
            locked_down,
            alerted,
        }
    }
}
