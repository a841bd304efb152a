//! Timed records
//!
//! A record is actionable once `now >= due_at`. Records with a recurrence are
//! moved forward after each firing, anchored on the previous due time so the
//! schedule never drifts toward the firing time.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{StoreError, StoreResult};

/// The feature a record belongs to; selects the sweep handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Lift a temporary ban
    #[display("temp_ban")]
    TempBan,
    /// Remove a temporary mute role
    #[display("temp_mute")]
    TempMute,
    /// Deliver a user reminder
    #[display("reminder")]
    Reminder,
    /// Draw giveaway winners
    #[display("giveaway_end")]
    GiveawayEnd,
    /// Ping attendees ahead of a scheduled event
    #[display("event_reminder")]
    EventReminder,
    /// Daily birthday announcement pass for a guild
    #[display("birthday_check")]
    BirthdayCheck,
}

/// A time-anchored record held by an `ExpiryStore`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedRecord {
    /// Unique within the store; assigned on add when empty
    #[serde(default)]
    pub id: String,
    pub kind: RecordKind,
    /// When the record becomes actionable (UTC, RFC 3339 on disk)
    pub due_at: DateTime<Utc>,
    /// Feature-specific data
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Seconds between occurrences for recurring records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_seconds: Option<u64>,
}

impl TimedRecord {
    /// Create a one-shot record with no id yet
    pub fn new(kind: RecordKind, due_at: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            id: String::new(),
            kind,
            due_at,
            payload,
            recurrence_seconds: None,
        }
    }

    /// Build a record from a typed payload
    ///
    /// # Errors
    /// Returns `StoreError::Serialize` if the payload cannot be encoded as JSON
    pub fn with_payload<P: Serialize>(
        kind: RecordKind,
        due_at: DateTime<Utc>,
        payload: &P,
    ) -> StoreResult<Self> {
        let payload =
            serde_json::to_value(payload).map_err(|e| StoreError::Serialize(e.to_string()))?;
        Ok(Self::new(kind, due_at, payload))
    }

    /// Make this record recur every `seconds`
    #[must_use]
    pub fn recurring(mut self, seconds: u64) -> Self {
        self.recurrence_seconds = Some(seconds).filter(|s| *s > 0);
        self
    }

    /// Fill in a fresh id if none was given
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }

    /// Decode the payload into a feature type
    ///
    /// # Errors
    /// Returns `StoreError::Deserialize` if the payload has the wrong shape
    pub fn payload_as<P: DeserializeOwned>(&self) -> StoreResult<P> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            StoreError::Deserialize(format!("{} record {}: {e}", self.kind, self.id))
        })
    }

    #[must_use]
    pub fn recurrence(&self) -> Option<Duration> {
        self.recurrence_seconds
            .filter(|s| *s > 0)
            .and_then(|s| i64::try_from(s).ok())
            .and_then(Duration::try_seconds)
    }

    /// Check whether the record is actionable at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.due_at
    }

    /// Next due time for a recurring record, anchored on the current `due_at`
    #[must_use]
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        self.recurrence()
            .and_then(|every| self.due_at.checked_add_signed(every))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ban {
        guild_id: u64,
        user_id: u64,
    }

    #[test]
    fn test_is_due_inclusive() {
        let due = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let record = TimedRecord::new(RecordKind::TempBan, due, json!({}));

        assert!(!record.is_due(due - Duration::seconds(1)));
        assert!(record.is_due(due));
        assert!(record.is_due(due + Duration::seconds(1)));
    }

    #[test]
    fn test_next_occurrence_anchored_on_due_at() {
        let due = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let record = TimedRecord::new(RecordKind::Reminder, due, json!({})).recurring(3600);

        assert_eq!(record.next_occurrence(), Some(due + Duration::seconds(3600)));
        assert!(
            TimedRecord::new(RecordKind::Reminder, due, json!({}))
                .next_occurrence()
                .is_none()
        );
        // Zero is treated as no recurrence
        assert!(record.recurring(0).next_occurrence().is_none());
    }

    #[test]
    fn test_typed_payload() {
        let due = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let ban = Ban {
            guild_id: 1,
            user_id: 2,
        };
        let record = TimedRecord::with_payload(RecordKind::TempBan, due, &ban).unwrap();
        assert_eq!(record.payload_as::<Ban>().unwrap(), ban);

        let wrong = TimedRecord::new(RecordKind::TempBan, due, json!({"guild_id": "x"}));
        assert!(matches!(
            wrong.payload_as::<Ban>(),
            Err(StoreError::Deserialize(_))
        ));
    }

    #[test]
    fn test_ensure_id_keeps_existing() {
        let due = Utc::now();
        let mut record = TimedRecord::new(RecordKind::TempMute, due, json!(null));
        let generated = record.ensure_id().to_string();
        assert!(!generated.is_empty());
        assert_eq!(record.ensure_id(), generated);
    }

    #[test]
    fn test_yaml_layout() {
        let due = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        let mut record =
            TimedRecord::new(RecordKind::Reminder, due, json!({"message": "stretch"})).recurring(60);
        record.id = "r-1".to_string();

        let yaml = serde_yaml::to_string(&record).unwrap();
        assert!(yaml.contains("id: r-1"));
        assert!(yaml.contains("kind: reminder"));
        assert!(yaml.contains("2024-06-01T12:30:00Z"));
        assert!(yaml.contains("recurrence_seconds: 60"));

        let back: TimedRecord = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, record);
    }
}
