use std::env;
use std::sync::Arc;

use guild_warden::clock::Clock;
use guild_warden::config::BotConfig;
use guild_warden::discord::{GuildNotifier, GuildOps, SerenityOps};
use guild_warden::features::{FeatureDeps, birthday, build_sweepers};
use guild_warden::{BOT_NAME, CONSOLE_TARGET, Data, Error, commands, handlers, logging};
use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use tracing::{error, info, warn};

/// Give every guild with birthdays enabled its daily check
async fn schedule_birthday_checks(data: &Data) {
    let now = data.clock.now();
    for guild_id in data.guilds.guild_ids() {
        if !data.guild_settings(guild_id).birthdays.enabled {
            continue;
        }
        match birthday::ensure_scheduled(&data.stores.birthdays, guild_id, now).await {
            Ok(Some(id)) => info!(target: CONSOLE_TARGET, guild_id, record_id = %id, "Scheduled birthday check"),
            Ok(None) => {}
            Err(e) => warn!(target: CONSOLE_TARGET, guild_id, error = %e, "Failed to schedule birthday check"),
        }
    }
}

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let config = BotConfig::load().await?;
    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;

    let http = Arc::new(serenity::Http::new(&token));
    let ops: Arc<dyn GuildOps> = Arc::new(SerenityOps::new(http));
    let data = Data::load(config, Arc::clone(&ops)).await?;
    schedule_birthday_checks(&data).await;

    let deps = FeatureDeps {
        ops: Arc::clone(&ops),
        notifier: Arc::new(GuildNotifier::new(ops, data.guilds.clone())),
        guilds: data.guilds.clone(),
    };
    let sweepers: Vec<_> = build_sweepers(&data.stores, &deps, &data.clock, &data.config.sweeps)?
        .into_iter()
        .map(guild_warden::timed::Sweeper::start)
        .collect();
    info!(target: CONSOLE_TARGET, sweepers = sweepers.len(), "Timer sweepers running");

    let framework_data = data.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all(),
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| Box::pin(logging::on_error(error)),
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands globally");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(framework_data)
            })
        })
        .build();

    // GUILD_MEMBERS is privileged and must be enabled for the application
    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::MESSAGE_CONTENT;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(handlers::Handler::new(data.clone()))
        .framework(framework)
        .await?;

    info!(target: CONSOLE_TARGET, "Starting {BOT_NAME}...");
    tokio::select! {
        result = client.start() => {
            if let Err(e) = result {
                error!(target: CONSOLE_TARGET, error = %e, "Gateway client stopped");
            }
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(target: CONSOLE_TARGET, error = %e, "Failed to listen for ctrl-c");
            }
            info!(target: CONSOLE_TARGET, "Shutdown requested");
        }
    }

    client.shard_manager.shutdown_all().await;
    for sweeper in sweepers {
        sweeper.shutdown().await;
    }
    data.queue.shutdown().await;
    info!(target: CONSOLE_TARGET, "Shut down cleanly");

    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
