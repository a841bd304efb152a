//! Chat platform boundary
//!
//! Features and the raid detector talk to Discord only through `GuildOps`, so
//! their behaviour can be tested against a mock. `SerenityOps` is the live
//! implementation over serenity's HTTP client.

use crate::data::GuildSettingsStore;
use crate::raid::{MitigationError, Mitigator, NotifyError, NotifySink, RaidAction};
use crate::RAID_TARGET;
use poise::serenity_prelude::{
    self as serenity, ChannelId, ChannelType, GuildId, Http, HttpError, MessageId,
    PermissionOverwrite, PermissionOverwriteType, Permissions, ReactionType, RoleId, UserId,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Reason attached to audit-log entries for raid mitigation
pub const RAID_REASON: &str = "Anti-raid protection";
/// Reactions fetched per page when drawing giveaway winners
const REACTION_PAGE: u8 = 100;

/// Failure of a platform call
#[derive(Debug, Error)]
pub enum OpsError {
    /// The target (ban, member, channel, message) no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Discord error: {0}")]
    Discord(#[from] Box<serenity::Error>),
}

impl From<serenity::Error> for OpsError {
    fn from(err: serenity::Error) -> Self {
        if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &err {
            if response.status_code.as_u16() == 404 {
                return Self::NotFound(response.error.message.clone());
            }
        }
        Self::Discord(Box::new(err))
    }
}

pub type OpsResult<T> = Result<T, OpsError>;

/// Guild-level operations the bot performs
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait GuildOps: Send + Sync {
    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> OpsResult<()>;

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> OpsResult<()>;

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> OpsResult<()>;

    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64, reason: &str) -> OpsResult<()>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> OpsResult<()>;

    async fn send_message(&self, channel_id: u64, content: &str) -> OpsResult<()>;

    /// Non-bot users who reacted to a message with `emoji`
    async fn reaction_users(&self, channel_id: u64, message_id: u64, emoji: &str) -> OpsResult<Vec<u64>>;

    async fn system_channel(&self, guild_id: u64) -> OpsResult<Option<u64>>;

    /// Deny `SEND_MESSAGES` to `@everyone` in every text channel; returns how
    /// many channels were locked
    async fn lock_text_channels(&self, guild_id: u64) -> OpsResult<usize>;
}

/// `GuildOps` over serenity's HTTP client
pub struct SerenityOps {
    http: Arc<Http>,
}

impl SerenityOps {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl GuildOps for SerenityOps {
    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> OpsResult<()> {
        self.http
            .remove_ban(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await?;
        Ok(())
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> OpsResult<()> {
        self.http
            .kick_member(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await?;
        Ok(())
    }

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> OpsResult<()> {
        self.http
            .ban_user(GuildId::new(guild_id), UserId::new(user_id), 0, Some(reason))
            .await?;
        Ok(())
    }

    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64, reason: &str) -> OpsResult<()> {
        self.http
            .add_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await?;
        Ok(())
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> OpsResult<()> {
        self.http
            .remove_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await?;
        Ok(())
    }

    async fn send_message(&self, channel_id: u64, content: &str) -> OpsResult<()> {
        ChannelId::new(channel_id)
            .say(self.http.as_ref(), content)
            .await?;
        Ok(())
    }

    async fn reaction_users(&self, channel_id: u64, message_id: u64, emoji: &str) -> OpsResult<Vec<u64>> {
        let channel = ChannelId::new(channel_id);
        let message = MessageId::new(message_id);
        let mut users = Vec::new();
        let mut after: Option<UserId> = None;

        loop {
            let page = channel
                .reaction_users(
                    self.http.as_ref(),
                    message,
                    ReactionType::Unicode(emoji.to_string()),
                    Some(REACTION_PAGE),
                    after,
                )
                .await?;
            let full_page = page.len() == usize::from(REACTION_PAGE);
            after = page.last().map(|u| u.id);
            users.extend(page.into_iter().filter(|u| !u.bot).map(|u| u.id.get()));
            if !full_page || after.is_none() {
                break;
            }
        }
        Ok(users)
    }

    async fn system_channel(&self, guild_id: u64) -> OpsResult<Option<u64>> {
        let guild = GuildId::new(guild_id)
            .to_partial_guild(self.http.as_ref())
            .await?;
        Ok(guild.system_channel_id.map(ChannelId::get))
    }

    async fn lock_text_channels(&self, guild_id: u64) -> OpsResult<usize> {
        let guild = GuildId::new(guild_id);
        let everyone = guild.everyone_role();
        let channels = guild.channels(self.http.as_ref()).await?;

        let mut locked = 0;
        for (id, channel) in channels {
            if channel.kind != ChannelType::Text {
                continue;
            }
            let overwrite = PermissionOverwrite {
                allow: Permissions::empty(),
                deny: Permissions::SEND_MESSAGES,
                kind: PermissionOverwriteType::Role(everyone),
            };
            match id.create_permission(self.http.as_ref(), overwrite).await {
                Ok(()) => locked += 1,
                Err(e) => warn!(
                    target: RAID_TARGET,
                    guild_id = %guild_id,
                    channel_id = %id,
                    error = %e,
                    "Could not lock channel"
                ),
            }
        }
        Ok(locked)
    }
}

/// Raid mitigation carried out through `GuildOps`
pub struct OpsMitigator {
    ops: Arc<dyn GuildOps>,
}

impl OpsMitigator {
    pub fn new(ops: Arc<dyn GuildOps>) -> Self {
        Self { ops }
    }
}

#[async_trait::async_trait]
impl Mitigator for OpsMitigator {
    async fn act_on_member(
        &self,
        guild_id: u64,
        user_id: u64,
        action: RaidAction,
    ) -> Result<(), MitigationError> {
        let result = match action {
            RaidAction::Kick => self.ops.kick(guild_id, user_id, RAID_REASON).await,
            RaidAction::Ban => self.ops.ban(guild_id, user_id, RAID_REASON).await,
            RaidAction::None => Ok(()),
        };
        result.map_err(|e| MitigationError::Member {
            user_id,
            reason: e.to_string(),
        })
    }

    async fn lockdown(&self, guild_id: u64) -> Result<usize, MitigationError> {
        self.ops
            .lock_text_channels(guild_id)
            .await
            .map_err(|e| MitigationError::Lockdown {
                guild_id,
                reason: e.to_string(),
            })
    }
}

/// Sends guild notices to the configured log channel, falling back to the
/// guild's system channel
pub struct GuildNotifier {
    ops: Arc<dyn GuildOps>,
    settings: GuildSettingsStore,
}

impl GuildNotifier {
    pub fn new(ops: Arc<dyn GuildOps>, settings: GuildSettingsStore) -> Self {
        Self { ops, settings }
    }

    async fn target_channel(&self, guild_id: u64) -> Result<u64, NotifyError> {
        if let Some(channel) = self.settings.get(guild_id).log_channel_id {
            return Ok(channel);
        }
        match self.ops.system_channel(guild_id).await {
            Ok(Some(channel)) => Ok(channel),
            Ok(None) => Err(NotifyError {
                guild_id,
                reason: "no log or system channel configured".to_string(),
            }),
            Err(e) => Err(NotifyError {
                guild_id,
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl NotifySink for GuildNotifier {
    async fn send(&self, guild_id: u64, message: &str) -> Result<(), NotifyError> {
        let channel = self.target_channel(guild_id).await?;
        self.ops
            .send_message(channel, message)
            .await
            .map_err(|e| NotifyError {
                guild_id,
                reason: e.to_string(),
            })
    }
}
