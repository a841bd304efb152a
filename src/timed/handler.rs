//! Sweep handlers
//!
//! A handler performs the side effect of a due record (unban, send reminder,
//! draw winners) and tells the sweeper what to do with the record afterwards.

use super::{RecordKind, SweepError, SweepResult, TimedRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// What the sweeper does with a record after its handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Done; delete it (or move recurring records to their next occurrence)
    Consumed,
    /// Keep it and fire again at the given time
    Reschedule(DateTime<Utc>),
    /// Leave it untouched for the next tick
    Retry,
}

/// Performs the action for one record kind
///
/// Handlers may be called more than once for the same occurrence (a crash
/// between the side effect and the store update refires it), so the side
/// effect should tolerate repetition.
#[async_trait::async_trait]
pub trait SweepHandler: Send + Sync {
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome>;
}

/// Handlers keyed by record kind
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<RecordKind, Arc<dyn SweepHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the kind
    pub fn register(&mut self, kind: RecordKind, handler: Arc<dyn SweepHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Builder-style `register`
    #[must_use]
    pub fn with(mut self, kind: RecordKind, handler: Arc<dyn SweepHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    #[must_use]
    pub fn get(&self, kind: RecordKind) -> Option<Arc<dyn SweepHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Run the handler for the record's kind
    ///
    /// # Errors
    ///
    /// Returns `SweepError::NoHandler` if the kind has no handler, or the
    /// handler's own error.
    pub async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        match self.handlers.get(&record.kind) {
            Some(handler) => handler.fire(record).await,
            None => Err(SweepError::NoHandler(record.kind)),
        }
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<RecordKind> {
        self.handlers.keys().copied().collect()
    }
}

/// Adapter so a closure can serve as a handler
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> SweepHandler for FnHandler<F>
where
    F: Fn(&TimedRecord) -> SweepResult<SweepOutcome> + Send + Sync,
{
    async fn fire(&self, record: &TimedRecord) -> SweepResult<SweepOutcome> {
        (self.0)(record)
    }
}
