//! User reminders, optionally recurring

use crate::SWEEP_TARGET;
use crate::discord::{GuildOps, OpsError};
use crate::timed::{
    RecordKind, StoreResult, SweepError, SweepHandler, SweepOutcome, SweepResult, TimedRecord,
};
use crate::utils::discord_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub guild_id: u64,
    pub channel_id: u64,
    pub user_id: u64,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Reminder {
    /// Record due at `at`, repeating every `every_secs` when given
    ///
    /// # Errors
    /// Returns `StoreError::Serialize` if the payload cannot be encoded
    pub fn record(&self, at: DateTime<Utc>, every_secs: Option<u64>) -> StoreResult<TimedRecord> {
        let record = TimedRecord::with_payload(RecordKind::Reminder, at, self)?;
        Ok(match every_secs {
            Some(secs) => record.recurring(secs),
            None => record,
        })
    }

    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "<@{}> ⏰ **Reminder:** {}\n-# Set {}",
            self.user_id,
            self.message,
            discord_timestamp(self.created_at)
        )
    }
}

pub struct ReminderHandler {
    ops: Arc<dyn GuildOps>,
}

impl ReminderHandler {
    pub fn new(ops: Arc<dyn GuildOps>) -> Self {
        Self { ops }
    }
}

#[async_trait::async_trait]
impl SweepHandler for ReminderHandler {
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        let reminder: Reminder = record.payload_as()?;

        match self.ops.send_message(reminder.channel_id, &reminder.render()).await {
            Ok(()) => {
                info!(
                    target: SWEEP_TARGET,
                    record_id = %record.id,
                    user_id = %reminder.user_id,
                    recurring = record.recurrence_seconds.is_some(),
                    "Reminder delivered"
                );
                Ok(SweepOutcome::Consumed)
            }
            // The channel is gone for good; a recurring reminder would fail forever
            Err(OpsError::NotFound(what)) => {
                warn!(
                    target: SWEEP_TARGET,
                    record_id = %record.id,
                    channel_id = %reminder.channel_id,
                    missing = %what,
                    "Reminder channel gone, dropping reminder"
                );
                Ok(SweepOutcome::Consumed)
            }
            Err(e) => Err(SweepError::Handler(format!(
                "reminder {} not delivered: {e}",
                record.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::timed::{ExpiryStore, HandlerRegistry, Sweeper};
    use crate::discord::MockGuildOps;
    use chrono::{Duration, TimeZone};
    use mockall::predicate::{eq, function};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn reminder() -> Reminder {
        Reminder {
            guild_id: 1,
            channel_id: 10,
            user_id: 100,
            message: "stand up".to_string(),
            created_at: t0(),
        }
    }

    #[test]
    fn test_render_mentions_user() {
        let text = reminder().render();
        assert!(text.starts_with("<@100>"));
        assert!(text.contains("stand up"));
    }

    #[test]
    fn test_recurring_record() {
        let record = reminder().record(t0(), Some(3600)).unwrap();
        assert_eq!(record.recurrence_seconds, Some(3600));
        let once = reminder().record(t0(), None).unwrap();
        assert_eq!(once.recurrence_seconds, None);
    }

    #[tokio::test]
    async fn test_sends_to_channel() {
        let mut ops = MockGuildOps::new();
        ops.expect_send_message()
            .with(eq(10), function(|text: &str| text.contains("stand up")))
            .times(1)
            .returning(|_, _| Ok(()));
        let handler = ReminderHandler::new(Arc::new(ops));
        let record = reminder().record(t0(), None).unwrap();
        assert_eq!(handler.fire(&record).await.unwrap(), SweepOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_deleted_channel_is_dropped() {
        let mut ops = MockGuildOps::new();
        ops.expect_send_message()
            .returning(|_, _| Err(OpsError::NotFound("Unknown Channel".to_string())));
        let handler = ReminderHandler::new(Arc::new(ops));
        let record = reminder().record(t0(), None).unwrap();
        assert_eq!(handler.fire(&record).await.unwrap(), SweepOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_recurring_reminder_moves_forward_after_delivery() {
        let mut ops = MockGuildOps::new();
        ops.expect_send_message().times(1).returning(|_, _| Ok(()));
        let store = ExpiryStore::in_memory("reminders");
        let id = store
            .add(reminder().record(t0(), Some(3600)).unwrap())
            .await
            .unwrap();

        let sweeper = Sweeper::new(
            "reminders",
            store.clone(),
            HandlerRegistry::new().with(RecordKind::Reminder, Arc::new(ReminderHandler::new(Arc::new(ops)))),
            Arc::new(ManualClock::new(t0())),
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(10),
        )
        .unwrap();

        let report = sweeper.tick(t0() + Duration::seconds(5)).await;
        assert_eq!(report.rescheduled, 1);
        assert_eq!(store.get(&id).unwrap().due_at, t0() + Duration::hours(1));
    }
}
