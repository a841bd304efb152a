//! Temporary bans
//!
//! The ban itself is applied by the command; the record only remembers when
//! to lift it.

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

pub const UNBAN_REASON: &str = "Temporary ban expired";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempBan {
    pub guild_id: u64,
    pub user_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TempBan {
    /// Record that lifts this ban at `until`
    ///
    /// # Errors
    /// Returns `StoreError::Serialize` if the payload cannot be encoded
    pub fn record(&self, until: DateTime<Utc>) -> StoreResult<TimedRecord> {
        TimedRecord::with_payload(RecordKind::TempBan, until, self)
    }
}

pub struct TempBanHandler {
    ops: Arc<dyn GuildOps>,
    notifier: Arc<dyn NotifySink>,
}

impl TempBanHandler {
    pub fn new(ops: Arc<dyn GuildOps>, notifier: Arc<dyn NotifySink>) -> Self {
        Self { ops, notifier }
    }
}

#[async_trait::async_trait]
impl SweepHandler for TempBanHandler {
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        let ban: TempBan = record.payload_as()?;

        match self.ops.unban(ban.guild_id, ban.user_id, UNBAN_REASON).await {
            Ok(()) => info!(
                target: SWEEP_TARGET,
                guild_id = %ban.guild_id,
                user_id = %ban.user_id,
                "Temporary ban lifted"
            ),
            // Lifted by hand in the meantime
            Err(OpsError::NotFound(_)) => info!(
                target: SWEEP_TARGET,
                guild_id = %ban.guild_id,
                user_id = %ban.user_id,
                "Temporary ban already gone"
            ),
            Err(e) => {
                return Err(SweepError::Handler(format!(
                    "unban of {} in guild {} failed: {e}",
                    ban.user_id, ban.guild_id
                )));
            }
        }

        let notice = format!("🔓 <@{}> has been unbanned ({UNBAN_REASON}).", ban.user_id);
        if let Err(e) = self.notifier.send(ban.guild_id, &notice).await {
            warn!(target: SWEEP_TARGET, error = %e, "Unban notice not delivered");
        }
        Ok(SweepOutcome::Consumed)
    }
}
