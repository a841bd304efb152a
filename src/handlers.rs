use crate::clock::Clock;
use crate::{Data, EVENT_TARGET, RAID_TARGET};
use poise::serenity_prelude::{self as serenity, Context, EventHandler, GuildId, Member, Ready};
use tracing::{info, warn};

/// Gateway event handler; joins feed the raid detector
pub struct Handler {
    data: Data,
}

impl Handler {
    pub fn new(data: Data) -> Self {
        Self { data }
    }

    /// Run one join through the raid detector
    pub async fn on_member_join(&self, guild_id: u64, user_id: u64) {
        let settings = self.data.guild_settings(guild_id);
        let now = self.data.clock.now();

        if let Some(report) = self.data.raid.on_join(guild_id, user_id, now, &settings.raid).await {
            info!(
                target: RAID_TARGET,
                guild_id = %report.guild_id,
                members = report.members.len(),
                failed = report.failed.len(),
                locked_down = report.locked_down,
                alerted = report.alerted,
                "Raid mitigation finished"
            );
        }
    }
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!(target: EVENT_TARGET, "Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                target: EVENT_TARGET,
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!(target: EVENT_TARGET, "Cache ready! The bot is in {guild_count} guild(s)");
    }

    async fn guild_member_addition(&self, _ctx: Context, new_member: Member) {
        self.on_member_join(new_member.guild_id.get(), new_member.user.id.get())
            .await;
    }
}
