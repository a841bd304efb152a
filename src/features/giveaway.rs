//! Giveaways
//!
//! Entrants are whoever reacted with 🎉 to the giveaway message when it ends.

use crate::SWEEP_TARGET;
use crate::discord::{GuildOps, OpsError};
use crate::timed::{
    RecordKind, StoreResult, SweepError, SweepHandler, SweepOutcome, SweepResult, TimedRecord,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Reaction that enters a member into a giveaway
pub const ENTRY_EMOJI: &str = "🎉";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Giveaway {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub prize: String,
    pub winners: u32,
    pub host_id: u64,
}

impl Giveaway {
    /// # Errors
    /// Returns `StoreError::Serialize` if the payload cannot be encoded
    pub fn record(&self, ends_at: DateTime<Utc>) -> StoreResult<TimedRecord> {
        TimedRecord::with_payload(RecordKind::GiveawayEnd, ends_at, self)
    }

    /// Text of the giveaway announcement itself
    #[must_use]
    pub fn announcement(prize: &str, winners: u32, host_id: u64, ends_at: DateTime<Utc>) -> String {
        format!(
            "🎉 **GIVEAWAY** 🎉\n**Prize:** {prize}\n**Winners:** {winners}\n**Hosted by:** <@{host_id}>\n**Ends:** <t:{}:R>\n\nReact with {ENTRY_EMOJI} to enter!",
            ends_at.timestamp()
        )
    }

    #[must_use]
    pub fn result_message(&self, winners: &[u64]) -> String {
        if winners.is_empty() {
            return format!("🎉 Giveaway for **{}** ended. No valid entries.", self.prize);
        }
        let mentions: Vec<String> = winners.iter().map(|w| format!("<@{w}>")).collect();
        format!(
            "🎊 Congratulations {}! You won **{}**!",
            mentions.join(" "),
            self.prize
        )
    }
}

/// Pick up to `count` distinct winners uniformly at random
pub fn draw_winners<R: Rng + ?Sized>(entrants: &[u64], count: usize, rng: &mut R) -> Vec<u64> {
    let mut pool = entrants.to_vec();
    pool.sort_unstable();
    pool.dedup();
    pool.shuffle(rng);
    pool.truncate(count);
    pool
}

pub struct GiveawayHandler {
    ops: Arc<dyn GuildOps>,
}

impl GiveawayHandler {
    pub fn new(ops: Arc<dyn GuildOps>) -> Self {
        Self { ops }
    }
}

#[async_trait::async_trait]
impl SweepHandler for GiveawayHandler {
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        let giveaway: Giveaway = record.payload_as()?;

        let entrants = match self
            .ops
            .reaction_users(giveaway.channel_id, giveaway.message_id, ENTRY_EMOJI)
            .await
        {
            Ok(entrants) => entrants,
            Err(OpsError::NotFound(what)) => {
                warn!(
                    target: SWEEP_TARGET,
                    record_id = %record.id,
                    message_id = %giveaway.message_id,
                    missing = %what,
                    "Giveaway message gone, nothing to draw"
                );
                return Ok(SweepOutcome::Consumed);
            }
            Err(e) => return Err(SweepError::Handler(format!("giveaway {}: {e}", record.id))),
        };

        let count = usize::try_from(giveaway.winners).unwrap_or(usize::MAX);
        let winners = draw_winners(&entrants, count, &mut rand::rng());

        self.ops
            .send_message(giveaway.channel_id, &giveaway.result_message(&winners))
            .await
            .map_err(|e| SweepError::Handler(format!("giveaway {} result not announced: {e}", record.id)))?;

        info!(
            target: SWEEP_TARGET,
            record_id = %record.id,
            entrants = entrants.len(),
            winners = ?winners,
            "Giveaway ended"
        );
        Ok(SweepOutcome::Consumed)
    }
}
