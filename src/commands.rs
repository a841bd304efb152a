use crate::clock::Clock;
use crate::features::event::ScheduledEvent;
use crate::features::guild_of;
use crate::features::giveaway::{ENTRY_EMOJI, Giveaway};
use crate::features::reminder::Reminder;
use crate::features::tempban::TempBan;
use crate::features::tempmute::TempMute;
use crate::queue::Pending;
use crate::raid::RaidAction;
use crate::timed::TimedRecord;
use crate::utils::{
    discord_timestamp, format_duration, parse_duration, parse_mentions, parse_month_day,
};
use crate::{Data, Error};
use chrono::{DateTime, Duration, Utc};
use poise::serenity_prelude::{self as serenity, ReactionType};
use poise::{Context, command};

/// Shortest interval a recurring reminder may use
const MIN_RECURRENCE_SECS: u64 = 60;
const DURATION_HELP: &str = "❌ Invalid time format! Use: 10s, 5m, 2h, 1d";

fn guild_id(ctx: Context<'_, Data, Error>) -> Result<u64, Error> {
    ctx.guild_id()
        .map(serenity::GuildId::get)
        .ok_or_else(|| Error::from("This command only works in a server"))
}

fn duration_arg(input: &str) -> Result<Duration, Error> {
    parse_duration(input).ok_or_else(|| Error::from(DURATION_HELP))
}

/// Parse a duration argument and the moment it runs out, counted from `now`
fn deadline_arg(now: DateTime<Utc>, input: &str) -> Result<(Duration, DateTime<Utc>), Error> {
    let length = duration_arg(input)?;
    let until = now
        .checked_add_signed(length)
        .ok_or_else(|| Error::from(DURATION_HELP))?;
    Ok((length, until))
}

/// Persist a record through the action queue and wait for the id
async fn schedule(ctx: Context<'_, Data, Error>, record: TimedRecord) -> Result<String, Error> {
    Ok(ctx.data().queue.schedule(record).await?.outcome().await?)
}

/// Hand a record to the action queue without waiting for the write
async fn enqueue(
    ctx: Context<'_, Data, Error>,
    mut record: TimedRecord,
) -> Result<(String, Pending<String>), Error> {
    let id = record.ensure_id().to_string();
    let pending = ctx.data().queue.schedule(record).await?;
    Ok((id, pending))
}

/// Basic ping command
/// This command is used to check if the bot is responsive.
#[command(prefix_command, slash_command, guild_only)]
pub async fn ping(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    ctx.say("Pong!").await?;
    Ok(())
}

/// Ban a member for a limited time
#[command(prefix_command, slash_command, guild_only, required_permissions = "BAN_MEMBERS")]
pub async fn tempban(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to ban"] user: serenity::User,
    #[description = "How long, e.g. 2h or 1d"] duration: String,
    #[description = "Reason"]
    #[rest]
    reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let (length, until) = deadline_arg(ctx.data().clock.now(), &duration)?;
    let ban = TempBan {
        guild_id,
        user_id: user.id.get(),
        reason: reason.clone(),
    };

    // Expiry first, so a crash never leaves a ban without one
    let id = schedule(ctx, ban.record(until)?).await?;
    let audit = reason.as_deref().unwrap_or("Temporary ban");
    if let Err(e) = ctx.data().ops.ban(guild_id, user.id.get(), audit).await {
        ctx.data().queue.cancel(&id).await?.outcome().await?;
        return Err(e.into());
    }

    ctx.say(format!(
        "🔨 Banned **{}** for {} (until {}). Timer `{id}`",
        user.name,
        format_duration(length),
        discord_timestamp(until)
    ))
    .await?;
    Ok(())
}

/// Mute a member for a limited time using the configured muted role
#[command(prefix_command, slash_command, guild_only, required_permissions = "MODERATE_MEMBERS")]
pub async fn tempmute(
    ctx: Context<'_, Data, Error>,
    #[description = "Member to mute"] user: serenity::User,
    #[description = "How long, e.g. 10m"] duration: String,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let Some(role_id) = ctx.data().guild_settings(guild_id).muted_role_id else {
        ctx.say("❌ No muted role configured. Set one with `/settings`.").await?;
        return Ok(());
    };
    let (length, until) = deadline_arg(ctx.data().clock.now(), &duration)?;
    let mute = TempMute {
        guild_id,
        user_id: user.id.get(),
        role_id,
    };

    let id = schedule(ctx, mute.record(until)?).await?;
    if let Err(e) = ctx
        .data()
        .ops
        .add_role(guild_id, user.id.get(), role_id, "Temporary mute")
        .await
    {
        ctx.data().queue.cancel(&id).await?.outcome().await?;
        return Err(e.into());
    }

    ctx.say(format!(
        "🔇 Muted **{}** for {}. Timer `{id}`",
        user.name,
        format_duration(length)
    ))
    .await?;
    Ok(())
}

/// Set a reminder, optionally repeating
#[command(prefix_command, slash_command, guild_only)]
pub async fn remind(
    ctx: Context<'_, Data, Error>,
    #[description = "When, e.g. 30m"] when: String,
    #[description = "What to remind you of"] message: String,
    #[description = "Repeat interval, e.g. 1d"] every: Option<String>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let now = ctx.data().clock.now();
    let (_, at) = deadline_arg(now, &when)?;
    let every_secs = match every.as_deref() {
        Some(every) => {
            let secs = u64::try_from(duration_arg(every)?.num_seconds()).unwrap_or(0);
            if secs < MIN_RECURRENCE_SECS {
                ctx.say("❌ Recurring reminders must be at least 1m apart.").await?;
                return Ok(());
            }
            Some(secs)
        }
        None => None,
    };

    let reminder = Reminder {
        guild_id,
        channel_id: ctx.channel_id().get(),
        user_id: ctx.author().id.get(),
        message,
        created_at: now,
    };
    let (id, pending) = enqueue(ctx, reminder.record(at, every_secs)?).await?;

    ctx.say(format!(
        "⏰ I'll remind you {}{}. Timer `{id}`",
        discord_timestamp(at),
        every_secs.map_or_else(String::new, |s| format!(
            ", then every {}",
            format_duration(Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX)))
        ))
    ))
    .await?;
    pending.outcome().await?;
    Ok(())
}

/// Start a giveaway; members enter by reacting with 🎉
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
pub async fn giveaway(
    ctx: Context<'_, Data, Error>,
    #[description = "How long it runs, e.g. 1d"] duration: String,
    #[description = "Number of winners"] winners: u32,
    #[description = "Prize"]
    #[rest]
    prize: String,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    if winners < 1 {
        ctx.say("❌ There must be at least 1 winner!").await?;
        return Ok(());
    }
    let (_, ends_at) = deadline_arg(ctx.data().clock.now(), &duration)?;
    let host_id = ctx.author().id.get();

    let reply = ctx
        .say(Giveaway::announcement(&prize, winners, host_id, ends_at))
        .await?;
    let message = reply.message().await?;
    message
        .react(ctx.http(), ReactionType::Unicode(ENTRY_EMOJI.to_string()))
        .await?;

    let giveaway = Giveaway {
        guild_id,
        channel_id: message.channel_id.get(),
        message_id: message.id.get(),
        prize,
        winners,
        host_id,
    };
    schedule(ctx, giveaway.record(ends_at)?).await?;
    Ok(())
}

/// Schedule an event; you and anyone you mention get reminders 24h and 1h ahead
#[command(prefix_command, slash_command, guild_only)]
pub async fn event(
    ctx: Context<'_, Data, Error>,
    #[description = "Event name"] name: String,
    #[description = "Starts in, e.g. 3d"] starts_in: String,
    #[description = "Members to remind besides you, as mentions"] attendees: Option<String>,
    #[description = "Details"] description: Option<String>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let now = ctx.data().clock.now();
    let (_, starts_at) = deadline_arg(now, &starts_in)?;

    let mut ids: Vec<u64> = std::iter::once(ctx.author().id.get())
        .chain(attendees.as_deref().map(parse_mentions).unwrap_or_default())
        .collect();
    ids.sort_unstable();
    ids.dedup();

    let event = ScheduledEvent {
        guild_id,
        name,
        description: description.unwrap_or_default(),
        starts_at,
        attendees: ids,
    };
    let mut pending = Vec::new();
    for record in event.reminder_records(now)? {
        pending.push(enqueue(ctx, record).await?.1);
    }

    ctx.say(format!(
        "📅 **{}** scheduled for {} with {} reminder(s).",
        event.name,
        discord_timestamp(starts_at),
        pending.len()
    ))
    .await?;
    for write in pending {
        write.outcome().await?;
    }
    Ok(())
}

/// Cancel a pending timer by id
#[command(prefix_command, slash_command, guild_only, required_permissions = "MANAGE_MESSAGES")]
pub async fn timer_cancel(
    ctx: Context<'_, Data, Error>,
    #[description = "Timer id"] id: String,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let owned = ctx
        .data()
        .stores
        .find(&id)
        .is_some_and(|record| guild_of(&record) == Some(guild_id));
    if !owned {
        ctx.say(format!("❌ No timer `{id}` in this server.")).await?;
        return Ok(());
    }

    let removed = ctx.data().queue.cancel(&id).await?.outcome().await?;
    if removed {
        ctx.say(format!("🗑️ Timer `{id}` cancelled.")).await?;
    } else {
        ctx.say(format!("Timer `{id}` already fired.")).await?;
    }
    Ok(())
}

/// Show or change anti-raid protection
#[command(prefix_command, slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn antiraid(
    ctx: Context<'_, Data, Error>,
    #[description = "Turn protection on or off"] enabled: Option<bool>,
    #[description = "Joins that count as a raid"] threshold: Option<u32>,
    #[description = "Window in seconds"] window: Option<u64>,
    #[description = "kick, ban or none"] action: Option<String>,
    #[description = "Lock text channels on raid"] lockdown: Option<bool>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let action = action.as_deref().map(str::parse::<RaidAction>).transpose()?;
    if threshold == Some(0) || window == Some(0) {
        ctx.say("❌ Threshold and window must be at least 1.").await?;
        return Ok(());
    }

    let settings = ctx
        .data()
        .guilds
        .update(guild_id, |s| {
            if let Some(enabled) = enabled {
                s.raid.enabled = enabled;
            }
            if let Some(threshold) = threshold {
                s.raid.join_threshold = threshold;
            }
            if let Some(window) = window {
                s.raid.time_window = window;
            }
            if let Some(action) = action {
                s.raid.action = action;
            }
            if let Some(lockdown) = lockdown {
                s.raid.lockdown_on_raid = lockdown;
            }
        })
        .await?;
    // New settings start from an empty window
    ctx.data().raid.reset(guild_id);

    let raid = settings.raid;
    ctx.say(format!(
        "🛡️ Anti-raid: **{}**\nThreshold: **{}** joins in **{}s**\nAction: **{}**\nLockdown: **{}**",
        if raid.enabled { "enabled" } else { "disabled" },
        raid.join_threshold,
        raid.time_window,
        raid.action,
        raid.lockdown_on_raid
    ))
    .await?;
    Ok(())
}

/// Configure where notices go and which role mutes
#[command(prefix_command, slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn settings(
    ctx: Context<'_, Data, Error>,
    #[description = "Channel for moderation notices"] log_channel: Option<serenity::GuildChannel>,
    #[description = "Role used by tempmute"] muted_role: Option<serenity::Role>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let settings = ctx
        .data()
        .guilds
        .update(guild_id, |s| {
            if let Some(channel) = log_channel {
                s.log_channel_id = Some(channel.id.get());
            }
            if let Some(role) = muted_role {
                s.muted_role_id = Some(role.id.get());
            }
        })
        .await?;

    let show = |id: Option<u64>, mention: fn(u64) -> String| id.map_or_else(|| "not set".to_string(), mention);
    ctx.say(format!(
        "⚙️ Log channel: {}\nMuted role: {}",
        show(settings.log_channel_id, |id| format!("<#{id}>")),
        show(settings.muted_role_id, |id| format!("<@&{id}>"))
    ))
    .await?;
    Ok(())
}

/// Birthday commands
#[command(prefix_command, slash_command, guild_only, subcommands("birthday_set", "birthday_setup"))]
pub async fn birthday(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    ctx.say("Use `/birthday set MM-DD` or `/birthday setup`.").await?;
    Ok(())
}

/// Save your birthday (MM-DD)
#[command(prefix_command, slash_command, guild_only, rename = "set")]
pub async fn birthday_set(
    ctx: Context<'_, Data, Error>,
    #[description = "Your birthday as MM-DD"] date: String,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    if parse_month_day(&date).is_none() {
        ctx.say("❌ Invalid date! Use MM-DD, e.g. 03-15").await?;
        return Ok(());
    }
    let user_id = ctx.author().id.get();
    let date = date.trim().to_string();
    ctx.data()
        .guilds
        .update(guild_id, |s| {
            s.birthdays.dates.insert(user_id, date.clone());
        })
        .await?;
    ctx.say(format!("🎂 Birthday saved: {date}")).await?;
    Ok(())
}

/// Enable announcements in a channel, optionally granting a role on the day
#[command(prefix_command, slash_command, guild_only, rename = "setup", required_permissions = "MANAGE_GUILD")]
pub async fn birthday_setup(
    ctx: Context<'_, Data, Error>,
    #[description = "Announcement channel"] channel: serenity::GuildChannel,
    #[description = "Role for the day"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    ctx.data()
        .guilds
        .update(guild_id, |s| {
            s.birthdays.enabled = true;
            s.birthdays.channel_id = Some(channel.id.get());
            s.birthdays.role_id = role.as_ref().map(|r| r.id.get());
        })
        .await?;
    let pending = ctx
        .data()
        .queue
        .ensure_birthday_check(guild_id, ctx.data().clock.now())
        .await?;

    ctx.say(format!("🎉 Birthday announcements enabled in <#{}>", channel.id))
        .await?;
    pending.outcome().await?;
    Ok(())
}

/// Every command the bot registers
#[must_use]
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        ping(),
        tempban(),
        tempmute(),
        remind(),
        giveaway(),
        event(),
        timer_cancel(),
        antiraid(),
        settings(),
        birthday(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_command_definition() {
        let cmd = ping();
        assert_eq!(cmd.name, "ping");
        assert!(cmd.description.unwrap_or_default().contains("check if the bot is responsive"));
        assert!(cmd.guild_only);
    }

    #[test]
    fn test_all_commands_are_slash_commands() {
        for cmd in all() {
            assert!(cmd.guild_only, "{} should be guild only", cmd.name);
            assert!(cmd.create_as_slash_command().is_some(), "{} has no slash form", cmd.name);
        }
    }

    #[test]
    fn test_command_names() {
        let names: Vec<String> = all().into_iter().map(|c| c.name).collect();
        for expected in ["tempban", "tempmute", "remind", "giveaway", "event", "timer_cancel", "antiraid", "birthday"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_moderation_commands_need_permissions() {
        assert!(tempban().required_permissions.contains(serenity::Permissions::BAN_MEMBERS));
        assert!(antiraid().required_permissions.contains(serenity::Permissions::ADMINISTRATOR));
    }

    #[test]
    fn test_required_parameters_come_first() {
        for cmd in all() {
            let first_optional = cmd.parameters.iter().position(|p| !p.required);
            let last_required = cmd.parameters.iter().rposition(|p| p.required);
            if let (Some(opt), Some(req)) = (first_optional, last_required) {
                assert!(req < opt, "{} lists an optional parameter first", cmd.name);
            }
        }
    }

    #[test]
    fn test_birthday_subcommands() {
        let cmd = birthday();
        let subs: Vec<&str> = cmd.subcommands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(subs, ["set", "setup"]);
    }

    #[test]
    fn test_deadline_arg_rejects_overflow() {
        let now = Utc::now();
        let (length, until) = deadline_arg(now, "2h").unwrap();
        assert_eq!(length, Duration::hours(2));
        assert_eq!(until, now + Duration::hours(2));

        // Parses as a duration but lands past the end of the calendar
        assert!(parse_duration("99999999d").is_some());
        assert_eq!(deadline_arg(now, "99999999d").unwrap_err().to_string(), DURATION_HELP);
    }

    #[test]
    fn test_duration_arg_error_text() {
        assert_eq!(duration_arg("5m").unwrap(), Duration::minutes(5));
        assert_eq!(duration_arg("soon").unwrap_err().to_string(), DURATION_HELP);
    }
}
