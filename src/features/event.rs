//! Scheduled community events
//!
//! Creating an event schedules one reminder record per lead time. Each
//! reminder pings the attendees in the guild's system channel.

use crate::SWEEP_TARGET;
use crate::discord::{GuildOps, OpsError};
use crate::timed::{
    RecordKind, StoreResult, SweepError, SweepHandler, SweepOutcome, SweepResult, TimedRecord,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// How long before the start each reminder goes out
pub const LEAD_TIMES: [(i64, &str); 2] = [(24, "24 hours"), (1, "1 hour")];

/// An event as created by a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub guild_id: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub starts_at: DateTime<Utc>,
    pub attendees: Vec<u64>,
}

impl ScheduledEvent {
    /// Reminder records for every lead time that is still ahead of `now`
    ///
    /// # Errors
    /// Returns `StoreError::Serialize` if a payload cannot be encoded
    pub fn reminder_records(&self, now: DateTime<Utc>) -> StoreResult<Vec<TimedRecord>> {
        let mut records = Vec::new();
        for (hours, lead) in LEAD_TIMES {
            let due = self.starts_at - Duration::hours(hours);
            if due <= now {
                continue;
            }
            let reminder = EventReminder {
                event: self.clone(),
                lead: lead.to_string(),
            };
            records.push(TimedRecord::with_payload(RecordKind::EventReminder, due, &reminder)?);
        }
        Ok(records)
    }
}

/// Payload of one reminder record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReminder {
    pub event: ScheduledEvent,
    /// Human lead time, e.g. "1 hour"
    pub lead: String,
}

impl EventReminder {
    #[must_use]
    pub fn render(&self) -> String {
        let mentions: Vec<String> = self.event.attendees.iter().map(|id| format!("<@{id}>")).collect();
        let mut text = format!(
            "{}\n📅 **{}** starts in {} (<t:{}:F>)",
            mentions.join(" "),
            self.event.name,
            self.lead,
            self.event.starts_at.timestamp()
        );
        if !self.event.description.is_empty() {
            text.push('\n');
            text.push_str(&self.event.description);
        }
        text
    }
}

pub struct EventReminderHandler {
    ops: Arc<dyn GuildOps>,
}

impl EventReminderHandler {
    pub fn new(ops: Arc<dyn GuildOps>) -> Self {
        Self { ops }
    }
}

#[async_trait::async_trait]
impl SweepHandler for EventReminderHandler {
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        let reminder: EventReminder = record.payload_as()?;
        if reminder.event.attendees.is_empty() {
            return Ok(SweepOutcome::Consumed);
        }

        let guild_id = reminder.event.guild_id;
        let channel = match self.ops.system_channel(guild_id).await {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                warn!(
                    target: SWEEP_TARGET,
                    guild_id = %guild_id,
                    event = %reminder.event.name,
                    "No system channel, event reminder dropped"
                );
                return Ok(SweepOutcome::Consumed);
            }
            Err(e) => return Err(SweepError::Handler(format!("event reminder {}: {e}", record.id))),
        };

        match self.ops.send_message(channel, &reminder.render()).await {
            Ok(()) => {
                info!(
                    target: SWEEP_TARGET,
                    guild_id = %guild_id,
                    event = %reminder.event.name,
                    lead = %reminder.lead,
                    "Event reminder sent"
                );
                Ok(SweepOutcome::Consumed)
            }
            Err(OpsError::NotFound(_)) => Ok(SweepOutcome::Consumed),
            Err(e) => Err(SweepError::Handler(format!("event reminder {}: {e}", record.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::MockGuildOps;
    use chrono::TimeZone;
    use mockall::predicate::{eq, function};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 18, 0, 0).unwrap()
    }

    fn event(attendees: Vec<u64>) -> ScheduledEvent {
        ScheduledEvent {
            guild_id: 4,
            name: "Movie night".to_string(),
            description: "Bring snacks".to_string(),
            starts_at: t0() + Duration::days(3),
            attendees,
        }
    }

    #[test]
    fn test_schedules_both_lead_times() {
        let records = event(vec![1]).reminder_records(t0()).unwrap();
        let due: Vec<DateTime<Utc>> = records.iter().map(|r| r.due_at).collect();
        assert_eq!(
            due,
            vec![
                t0() + Duration::days(3) - Duration::hours(24),
                t0() + Duration::days(3) - Duration::hours(1),
            ]
        );
        assert!(records.iter().all(|r| r.kind == RecordKind::EventReminder));
    }

    #[test]
    fn test_skips_lead_times_already_past() {
        let mut soon = event(vec![1]);
        soon.starts_at = t0() + Duration::hours(5);
        let records = soon.reminder_records(t0()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["lead"], "1 hour");

        soon.starts_at = t0() + Duration::minutes(30);
        assert!(soon.reminder_records(t0()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pings_attendees_in_system_channel() {
        let mut ops = MockGuildOps::new();
        ops.expect_system_channel().with(eq(4)).returning(|_| Ok(Some(40)));
        ops.expect_send_message()
            .with(
                eq(40),
                function(|text: &str| {
                    text.contains("<@1> <@2>") && text.contains("Movie night") && text.contains("24 hours")
                }),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        let record = event(vec![1, 2]).reminder_records(t0()).unwrap().remove(0);
        let handler = EventReminderHandler::new(Arc::new(ops));
        assert_eq!(handler.fire(&record).await.unwrap(), SweepOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_no_attendees_no_message() {
        let mut ops = MockGuildOps::new();
        ops.expect_system_channel().never();
        ops.expect_send_message().never();

        let record = event(Vec::new()).reminder_records(t0()).unwrap().remove(0);
        let handler = EventReminderHandler::new(Arc::new(ops));
        assert_eq!(handler.fire(&record).await.unwrap(), SweepOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_no_system_channel_drops_reminder() {
        let mut ops = MockGuildOps::new();
        ops.expect_system_channel().returning(|_| Ok(None));
        ops.expect_send_message().never();

        let record = event(vec![1]).reminder_records(t0()).unwrap().remove(0);
        let handler = EventReminderHandler::new(Arc::new(ops));
        assert_eq!(handler.fire(&record).await.unwrap(), SweepOutcome::Consumed);
    }
}
