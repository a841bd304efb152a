use crate::{COMMAND_TARGET, CONSOLE_TARGET, Context, Data, ERROR_TARGET, Error, RAID_TARGET, SWEEP_TARGET};
use poise::FrameworkError;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::filter_fn,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Command log file name
pub const COMMAND_LOG_FILE: &str = "commands";
/// Sweeper, queue and raid log file name
pub const TIMER_LOG_FILE: &str = "timers";

fn is_command_event(target: &str) -> bool {
    target.starts_with(COMMAND_TARGET) || target.starts_with(ERROR_TARGET)
}

fn is_timer_event(target: &str) -> bool {
    target.starts_with(SWEEP_TARGET) || target.starts_with(RAID_TARGET)
}

/// Initialize the logging system with console and file outputs
pub fn init() -> Result<(), Error> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let command_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, COMMAND_LOG_FILE);
    let timer_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, TIMER_LOG_FILE);

    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    let command_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(command_file)
        .with_filter(filter_fn(|meta| is_command_event(meta.target())));

    // Expiries and raid mitigations, one JSON object per line
    let timer_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(timer_file)
        .with_filter(filter_fn(|meta| is_timer_event(meta.target())));

    // Default to INFO, with serenity's heartbeat chatter silenced
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info").add_directive("serenity=error".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(command_layer)
        .with(timer_layer)
        .try_init()?;

    info!(target: CONSOLE_TARGET, "Logging system initialized");
    Ok(())
}

thread_local! {
    static COMMAND_START_TIME: std::cell::RefCell<Option<Instant>> = const { std::cell::RefCell::new(None) };
}

fn guild_label(ctx: Context<'_>) -> String {
    ctx.guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.get().to_string())
}

/// Log the start of a command execution (pre-command hook)
pub fn log_command_start(ctx: Context<'_>) {
    COMMAND_START_TIME.with(|cell| {
        *cell.borrow_mut() = Some(Instant::now());
    });

    let args = if ctx.command().parameters.is_empty() {
        String::new()
    } else {
        format!("{:?}", ctx.invocation_string())
    };

    info!(
        target: COMMAND_TARGET,
        command = %ctx.command().qualified_name,
        guild_id = %guild_label(ctx),
        user_id = %ctx.author().id.get(),
        arguments = %args,
        event = "start",
        "Command execution started"
    );
}

/// Log the end of a command execution (post-command hook)
pub fn log_command_end(ctx: Context<'_>) {
    let duration =
        COMMAND_START_TIME.with(|cell| cell.borrow_mut().take().map(|start| start.elapsed()));
    let duration_ms = u64::try_from(duration.map_or(0, |d| d.as_millis())).unwrap_or_default();

    info!(
        target: COMMAND_TARGET,
        command = %ctx.command().qualified_name,
        guild_id = %guild_label(ctx),
        user_id = %ctx.author().id.get(),
        duration_ms = duration_ms,
        event = "end",
        "Command execution completed"
    );
}

/// Log a framework error, then tell the invoking user what went wrong
pub async fn on_error(error: FrameworkError<'_, Data, Error>) {
    log_command_error(&error);

    let reply = match &error {
        FrameworkError::Command { error, ctx, .. } => Some((*ctx, format!("{error}"))),
        FrameworkError::ArgumentParse { input, ctx, .. } => Some((
            *ctx,
            input.as_deref().map_or_else(
                || "❌ Missing or invalid arguments".to_string(),
                |input| format!("❌ Could not understand `{input}`"),
            ),
        )),
        FrameworkError::MissingUserPermissions { ctx, .. } => {
            Some((*ctx, "❌ You don't have permission to use this command".to_string()))
        }
        _ => None,
    };

    if let Some((ctx, message)) = reply {
        if let Err(e) = ctx.say(message).await {
            error!(target: ERROR_TARGET, error = %e, "Failed to report command error");
        }
    }
}

/// Log errors that occur during command execution
pub fn log_command_error(error: &FrameworkError<'_, Data, Error>) {
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            error!(
                target: ERROR_TARGET,
                command = %ctx.command().qualified_name,
                guild_id = %guild_label(*ctx),
                user_id = %ctx.author().id.get(),
                error = %error,
                "Command error"
            );
        }
        FrameworkError::CommandCheckFailed { error, ctx, .. } => {
            let error_msg = error
                .as_ref()
                .map_or_else(|| "Check failed".to_string(), ToString::to_string);

            error!(
                target: ERROR_TARGET,
                command = %ctx.command().qualified_name,
                guild_id = %guild_label(*ctx),
                user_id = %ctx.author().id.get(),
                error = %error_msg,
                "Command check failed"
            );
        }
        err => {
            error!(
                target: ERROR_TARGET,
                error = ?err,
                "Other framework error"
            );
        }
    }
}

pub fn log_console(message: &str) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SETTINGS_TARGET;

    #[test]
    fn test_event_routing_by_target() {
        assert!(is_command_event(COMMAND_TARGET));
        assert!(is_command_event(ERROR_TARGET));
        assert!(!is_command_event(SWEEP_TARGET));

        assert!(is_timer_event(SWEEP_TARGET));
        assert!(is_timer_event(RAID_TARGET));
        assert!(!is_timer_event(COMMAND_TARGET));
        assert!(!is_timer_event(CONSOLE_TARGET));
        assert!(!is_timer_event(SETTINGS_TARGET));
        assert!(!is_command_event(SETTINGS_TARGET));
    }
}
