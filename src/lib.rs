pub mod clock;
pub mod commands;
pub mod config;
pub mod data;
pub mod discord;
pub mod features;
pub mod handlers;
pub mod logging;
pub mod queue;
pub mod raid;
pub mod timed;
pub mod utils;
pub mod window;

pub const BOT_NAME: &str = "guild_warden";
pub const COMMAND_TARGET: &str = "guild_warden::command";
pub const ERROR_TARGET: &str = "guild_warden::error";
pub const EVENT_TARGET: &str = "guild_warden::handlers";
pub const CONSOLE_TARGET: &str = "guild_warden";
/// Timer stores, sweepers and the action queue
pub const SWEEP_TARGET: &str = "guild_warden::sweeper";
/// Join-rate detection and mitigation
pub const RAID_TARGET: &str = "guild_warden::raid";
/// Per-guild settings files
pub const SETTINGS_TARGET: &str = "guild_warden::settings";

pub use data::{Data, DataInner, GuildSettings};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
