//! Timed features
//!
//! Each feature owns one `ExpiryStore` namespace, a payload type describing
//! its records and a `SweepHandler` that performs the due action through
//! `GuildOps`.

pub mod birthday;
pub mod event;
pub mod giveaway;
pub mod reminder;
pub mod tempban;
pub mod tempmute;

use crate::clock::Clock;
use crate::config::SweepConfig;
use crate::data::GuildSettingsStore;
use crate::discord::GuildOps;
use crate::raid::NotifySink;
use crate::timed::{
    ExpiryStore, HandlerRegistry, RecordKind, StoreResult, SweepResult, Sweeper, TimedRecord,
    YamlFileBackend,
};
use std::path::Path;
use std::sync::Arc;

/// One store per feature, each persisted to its own file
#[derive(Debug, Clone)]
pub struct FeatureStores {
    pub temp_bans: ExpiryStore,
    pub temp_mutes: ExpiryStore,
    pub reminders: ExpiryStore,
    pub giveaways: ExpiryStore,
    pub event_reminders: ExpiryStore,
    pub birthdays: ExpiryStore,
}

impl FeatureStores {
    /// Open every store under `dir` as `<namespace>.yaml`
    ///
    /// # Errors
    /// Returns the first store that fails to load
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        let open = |ns: &'static str| async move {
            ExpiryStore::open(ns, Arc::new(YamlFileBackend::in_dir(dir, ns))).await
        };

        Ok(Self {
            temp_bans: open(namespace(RecordKind::TempBan)).await?,
            temp_mutes: open(namespace(RecordKind::TempMute)).await?,
            reminders: open(namespace(RecordKind::Reminder)).await?,
            giveaways: open(namespace(RecordKind::GiveawayEnd)).await?,
            event_reminders: open(namespace(RecordKind::EventReminder)).await?,
            birthdays: open(namespace(RecordKind::BirthdayCheck)).await?,
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            temp_bans: ExpiryStore::in_memory(namespace(RecordKind::TempBan)),
            temp_mutes: ExpiryStore::in_memory(namespace(RecordKind::TempMute)),
            reminders: ExpiryStore::in_memory(namespace(RecordKind::Reminder)),
            giveaways: ExpiryStore::in_memory(namespace(RecordKind::GiveawayEnd)),
            event_reminders: ExpiryStore::in_memory(namespace(RecordKind::EventReminder)),
            birthdays: ExpiryStore::in_memory(namespace(RecordKind::BirthdayCheck)),
        }
    }

    /// The store that holds records of `kind`
    #[must_use]
    pub fn for_kind(&self, kind: RecordKind) -> &ExpiryStore {
        match kind {
            RecordKind::TempBan => &self.temp_bans,
            RecordKind::TempMute => &self.temp_mutes,
            RecordKind::Reminder => &self.reminders,
            RecordKind::GiveawayEnd => &self.giveaways,
            RecordKind::EventReminder => &self.event_reminders,
            RecordKind::BirthdayCheck => &self.birthdays,
        }
    }

    #[must_use]
    pub fn all(&self) -> [&ExpiryStore; 6] {
        [
            &self.temp_bans,
            &self.temp_mutes,
            &self.reminders,
            &self.giveaways,
            &self.event_reminders,
            &self.birthdays,
        ]
    }

    /// Look a record up by id in every store
    #[must_use]
    pub fn find(&self, id: &str) -> Option<TimedRecord> {
        self.all().into_iter().find_map(|store| store.get(id))
    }
}

/// Guild a record belongs to, read from wherever its kind keeps it
#[must_use]
pub fn guild_of(record: &TimedRecord) -> Option<u64> {
    let payload = match record.kind {
        RecordKind::EventReminder => record.payload.get("event")?,
        _ => &record.payload,
    };
    payload.get("guild_id").and_then(serde_json::Value::as_u64)
}

/// Store namespace (and file stem) for a record kind
#[must_use]
pub const fn namespace(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::TempBan => "temp_bans",
        RecordKind::TempMute => "temp_mutes",
        RecordKind::Reminder => "reminders",
        RecordKind::GiveawayEnd => "giveaways",
        RecordKind::EventReminder => "event_reminders",
        RecordKind::BirthdayCheck => "birthdays",
    }
}

/// Everything a feature handler may need
#[derive(Clone)]
pub struct FeatureDeps {
    pub ops: Arc<dyn GuildOps>,
    pub notifier: Arc<dyn NotifySink>,
    pub guilds: GuildSettingsStore,
}

/// Build one sweeper per feature, each with its configured cadence
///
/// # Errors
/// Returns `SweepError::InvalidCadence` if any schedule is zero
pub fn build_sweepers(
    stores: &FeatureStores,
    deps: &FeatureDeps,
    clock: &Arc<dyn Clock>,
    config: &SweepConfig,
) -> SweepResult<Vec<Sweeper>> {
    let plan = [
        (
            RecordKind::TempBan,
            config.temp_bans,
            HandlerRegistry::new().with(
                RecordKind::TempBan,
                Arc::new(tempban::TempBanHandler::new(deps.ops.clone(), deps.notifier.clone())),
            ),
        ),
        (
            RecordKind::TempMute,
            config.temp_mutes,
            HandlerRegistry::new().with(
                RecordKind::TempMute,
                Arc::new(tempmute::TempMuteHandler::new(deps.ops.clone(), deps.notifier.clone())),
            ),
        ),
        (
            RecordKind::Reminder,
            config.reminders,
            HandlerRegistry::new().with(
                RecordKind::Reminder,
                Arc::new(reminder::ReminderHandler::new(deps.ops.clone())),
            ),
        ),
        (
            RecordKind::GiveawayEnd,
            config.giveaways,
            HandlerRegistry::new().with(
                RecordKind::GiveawayEnd,
                Arc::new(giveaway::GiveawayHandler::new(deps.ops.clone())),
            ),
        ),
        (
            RecordKind::EventReminder,
            config.event_reminders,
            HandlerRegistry::new().with(
                RecordKind::EventReminder,
                Arc::new(event::EventReminderHandler::new(deps.ops.clone())),
            ),
        ),
        (
            RecordKind::BirthdayCheck,
            config.birthdays,
            HandlerRegistry::new().with(
                RecordKind::BirthdayCheck,
                Arc::new(birthday::BirthdayHandler::new(
                    deps.ops.clone(),
                    deps.guilds.clone(),
                    Arc::clone(clock),
                )),
            ),
        ),
    ];

    plan.into_iter()
        .map(|(kind, schedule, handlers)| {
            Sweeper::new(
                namespace(kind),
                stores.for_kind(kind).clone(),
                handlers,
                Arc::clone(clock),
                schedule.interval(),
                schedule.handler_timeout(),
            )
        })
        .collect()
}
