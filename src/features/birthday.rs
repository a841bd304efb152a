//! Birthday announcements
//!
//! Every guild with birthdays enabled owns one daily check record, due at
//! 00:00 UTC and recurring every 24 hours. The check announces members whose
//! `MM-DD` matches the date of the occurrence it fires for.

use crate::SWEEP_TARGET;
use crate::clock::Clock;
use crate::data::{BirthdaySettings, GuildSettingsStore};
use crate::discord::GuildOps;
use crate::timed::{
    ExpiryStore, RecordKind, StoreError, StoreResult, SweepHandler, SweepOutcome, SweepResult,
    TimedRecord,
};
use crate::utils::parse_month_day;
use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const DAY_SECS: u64 = 86_400;
pub const ROLE_REASON: &str = "Birthday!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthdayCheck {
    pub guild_id: u64,
}

impl BirthdayCheck {
    /// Daily record starting at the first midnight after `now`
    ///
    /// # Errors
    /// Returns `StoreError::InvalidRecord` if `now` is at the end of the
    /// representable calendar
    pub fn record(&self, now: DateTime<Utc>) -> StoreResult<TimedRecord> {
        let midnight = now
            .date_naive()
            .checked_add_days(Days::new(1))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| StoreError::InvalidRecord(format!("no midnight after {now}")))?
            .and_utc();
        Ok(TimedRecord::with_payload(RecordKind::BirthdayCheck, midnight, self)?.recurring(DAY_SECS))
    }
}

/// Make sure a guild has its daily check, returning the id of a new record
///
/// # Errors
/// Returns the store error if the record cannot be persisted
pub async fn ensure_scheduled(
    store: &ExpiryStore,
    guild_id: u64,
    now: DateTime<Utc>,
) -> StoreResult<Option<String>> {
    store
        .add_unless(BirthdayCheck { guild_id }.record(now)?, |r| is_check_for(r, guild_id))
        .await
}

/// Whether `record` is the daily check of `guild_id`
#[must_use]
pub fn is_check_for(record: &TimedRecord, guild_id: u64) -> bool {
    record.kind == RecordKind::BirthdayCheck
        && record.payload.get("guild_id").and_then(serde_json::Value::as_u64) == Some(guild_id)
}

/// Members whose birthday falls on `date`, in user id order
#[must_use]
pub fn celebrants(settings: &BirthdaySettings, date: NaiveDate) -> Vec<u64> {
    settings
        .dates
        .iter()
        .filter(|(_, day)| parse_month_day(day) == Some((date.month(), date.day())))
        .map(|(user, _)| *user)
        .collect()
}

pub struct BirthdayHandler {
    ops: Arc<dyn GuildOps>,
    guilds: GuildSettingsStore,
    clock: Arc<dyn Clock>,
}

impl BirthdayHandler {
    pub fn new(ops: Arc<dyn GuildOps>, guilds: GuildSettingsStore, clock: Arc<dyn Clock>) -> Self {
        Self { ops, guilds, clock }
    }
}

#[async_trait::async_trait]
impl SweepHandler for BirthdayHandler {
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        let check: BirthdayCheck = record.payload_as()?;
        let settings = self.guilds.get(check.guild_id).birthdays;
        if !settings.enabled {
            return Ok(SweepOutcome::Consumed);
        }
        let Some(channel) = settings.channel_id else {
            warn!(target: SWEEP_TARGET, guild_id = %check.guild_id, "Birthdays enabled without a channel");
            return Ok(SweepOutcome::Consumed);
        };

        // Occurrences missed while offline are not announced a day late
        if self.clock.now() - record.due_at >= Duration::days(1) {
            info!(
                target: SWEEP_TARGET,
                guild_id = %check.guild_id,
                due_at = %record.due_at,
                "Skipping stale birthday check"
            );
            return Ok(SweepOutcome::Consumed);
        }

        let date = record.due_at.date_naive();
        let users = celebrants(&settings, date);
        for user_id in &users {
            if let Err(e) = self.ops.send_message(channel, &settings.render(*user_id)).await {
                warn!(target: SWEEP_TARGET, guild_id = %check.guild_id, user_id = %user_id, error = %e, "Birthday message failed");
            }
            if let Some(role_id) = settings.role_id {
                if let Err(e) = self.ops.add_role(check.guild_id, *user_id, role_id, ROLE_REASON).await {
                    warn!(target: SWEEP_TARGET, guild_id = %check.guild_id, user_id = %user_id, error = %e, "Birthday role not granted");
                }
            }
        }

        if !users.is_empty() {
            info!(target: SWEEP_TARGET, guild_id = %check.guild_id, date = %date, count = users.len(), "Birthdays announced");
        }
        Ok(SweepOutcome::Consumed)
    }
}
