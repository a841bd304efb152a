//! Temporary mutes, implemented as a muted role that is taken away again

use crate::SWEEP_TARGET;
use crate::discord::{GuildOps, OpsError};
use crate::raid::NotifySink;
use crate::timed::{
    RecordKind, StoreResult, SweepError, SweepHandler, SweepOutcome, SweepResult, TimedRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const UNMUTE_REASON: &str = "Temporary mute expired";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempMute {
    pub guild_id: u64,
    pub user_id: u64,
    /// The muted role at the time of muting
    pub role_id: u64,
}

impl TempMute {
    /// # Errors
    /// Returns `StoreError::Serialize` if the payload cannot be encoded
    pub fn record(&self, until: DateTime<Utc>) -> StoreResult<TimedRecord> {
        TimedRecord::with_payload(RecordKind::TempMute, until, self)
    }
}

pub struct TempMuteHandler {
    ops: Arc<dyn GuildOps>,
    notifier: Arc<dyn NotifySink>,
}

impl TempMuteHandler {
    pub fn new(ops: Arc<dyn GuildOps>, notifier: Arc<dyn NotifySink>) -> Self {
        Self { ops, notifier }
    }
}

#[async_trait::async_trait]
impl SweepHandler for TempMuteHandler {
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        let mute: TempMute = record.payload_as()?;

        match self
            .ops
            .remove_role(mute.guild_id, mute.user_id, mute.role_id, UNMUTE_REASON)
            .await
        {
            Ok(()) => {}
            // Member left or role deleted
            Err(OpsError::NotFound(what)) => {
                info!(
                    target: SWEEP_TARGET,
                    guild_id = %mute.guild_id,
                    user_id = %mute.user_id,
                    missing = %what,
                    "Nothing left to unmute"
                );
                return Ok(SweepOutcome::Consumed);
            }
            Err(e) => {
                return Err(SweepError::Handler(format!(
                    "unmute of {} in guild {} failed: {e}",
                    mute.user_id, mute.guild_id
                )));
            }
        }

        info!(target: SWEEP_TARGET, guild_id = %mute.guild_id, user_id = %mute.user_id, "Temporary mute lifted");
        let notice = format!("🔊 <@{}> has been unmuted ({UNMUTE_REASON}).", mute.user_id);
        if let Err(e) = self.notifier.send(mute.guild_id, &notice).await {
            warn!(target: SWEEP_TARGET, error = %e, "Unmute notice not delivered");
        }
        Ok(SweepOutcome::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::MockGuildOps;
    use crate::raid::MockNotifySink;
    use mockall::predicate::eq;

    fn record() -> TimedRecord {
        TempMute {
            guild_id: 3,
            user_id: 30,
            role_id: 300,
        }
        .record(Utc::now())
        .unwrap()
    }

    #[tokio::test]
    async fn test_removes_muted_role() {
        let mut ops = MockGuildOps::new();
        ops.expect_remove_role()
            .with(eq(3), eq(30), eq(300), eq(UNMUTE_REASON))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut notifier = MockNotifySink::new();
        notifier.expect_send().times(1).returning(|_, _| Ok(()));

        let handler = TempMuteHandler::new(Arc::new(ops), Arc::new(notifier));
        assert_eq!(handler.fire(&record()).await.unwrap(), SweepOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_member_gone_consumes_quietly() {
        let mut ops = MockGuildOps::new();
        ops.expect_remove_role()
            .returning(|_, _, _, _| Err(OpsError::NotFound("Unknown Member".to_string())));
        let mut notifier = MockNotifySink::new();
        notifier.expect_send().never();

        let handler = TempMuteHandler::new(Arc::new(ops), Arc::new(notifier));
        assert_eq!(handler.fire(&record()).await.unwrap(), SweepOutcome::Consumed);
    }

    #[tokio::test]
    async fn test_api_failure_is_retried() {
        let mut ops = MockGuildOps::new();
        ops.expect_remove_role().returning(|_, _, _, _| {
            Err(OpsError::Discord(Box::new(poise::serenity_prelude::Error::Other(
                "rate limited",
            ))))
        });
        let handler = TempMuteHandler::new(Arc::new(ops), Arc::new(MockNotifySink::new()));
        assert!(handler.fire(&record()).await.is_err());
    }
}
