//! Timed action queue
//!
//! Commands and event handlers hand schedule/cancel requests to a single
//! worker task instead of writing to the stores inline. The caller may await
//! the outcome or drop it; the write happens either way.

use crate::SWEEP_TARGET;
use crate::features::{FeatureStores, birthday};
use crate::timed::{StoreError, TimedRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Timed action queue is closed")]
    Closed,

    #[error("Timed action worker dropped the request")]
    Dropped,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Requests understood by the worker
#[derive(Debug)]
pub enum TimedActionRequest {
    /// Persist a record into the store for its kind
    Schedule {
        record: TimedRecord,
        reply: oneshot::Sender<Result<String, StoreError>>,
    },
    /// Give a guild its daily birthday check unless it already has one
    EnsureBirthdayCheck {
        guild_id: u64,
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<Option<String>, StoreError>>,
    },
    /// Delete a record from whichever store holds it
    Cancel {
        id: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    Shutdown,
}

/// Outcome of a queued request, resolved once the worker has run it
#[must_use = "the request is queued either way; await this to see the result"]
pub struct Pending<T>(oneshot::Receiver<Result<T, StoreError>>);

impl<T> Pending<T> {
    /// Wait for the worker
    ///
    /// # Errors
    /// Returns the store error, or `QueueError::Dropped` if the worker stopped
    /// before answering
    pub async fn outcome(self) -> QueueResult<T> {
        Ok(self.0.await.map_err(|_| QueueError::Dropped)??)
    }
}

/// Sender side of the queue
#[derive(Clone)]
pub struct TimedActionQueue {
    tx: mpsc::Sender<TimedActionRequest>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TimedActionQueue {
    /// Spawn the worker over `stores`
    #[must_use]
    pub fn spawn(stores: FeatureStores) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(worker(stores, rx));
        Self {
            tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Queue a record for persistence
    ///
    /// # Errors
    /// Returns `QueueError::Closed` once the worker has shut down
    pub async fn schedule(&self, record: TimedRecord) -> QueueResult<Pending<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TimedActionRequest::Schedule { record, reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(Pending(rx))
    }

    /// Queue the daily birthday check for a guild; resolves to the new
    /// record id, or `None` if the guild already had one
    ///
    /// # Errors
    /// Returns `QueueError::Closed` once the worker has shut down
    pub async fn ensure_birthday_check(
        &self,
        guild_id: u64,
        now: DateTime<Utc>,
    ) -> QueueResult<Pending<Option<String>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TimedActionRequest::EnsureBirthdayCheck { guild_id, now, reply })
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(Pending(rx))
    }

    /// Queue a cancellation; resolves to `false` if no store held the id
    ///
    /// # Errors
    /// Returns `QueueError::Closed` once the worker has shut down
    pub async fn cancel(&self, id: &str) -> QueueResult<Pending<bool>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TimedActionRequest::Cancel {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| QueueError::Closed)?;
        Ok(Pending(rx))
    }

    /// Drain queued requests, then stop the worker
    pub async fn shutdown(&self) {
        if self.tx.send(TimedActionRequest::Shutdown).await.is_err() {
            debug!(target: SWEEP_TARGET, "Timed action queue already closed");
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!(target: SWEEP_TARGET, error = %e, "Timed action worker panicked");
            }
        }
    }
}

async fn worker(stores: FeatureStores, mut rx: mpsc::Receiver<TimedActionRequest>) {
    info!(target: SWEEP_TARGET, "Timed action worker started");

    while let Some(request) = rx.recv().await {
        match request {
            TimedActionRequest::Schedule { record, reply } => {
                let result = stores.for_kind(record.kind).add(record).await;
                if let Err(e) = &result {
                    error!(target: SWEEP_TARGET, error = %e, "Failed to schedule timed record");
                }
                // The requester may have stopped waiting
                let _ = reply.send(result);
            }
            TimedActionRequest::EnsureBirthdayCheck { guild_id, now, reply } => {
                let result = birthday::ensure_scheduled(&stores.birthdays, guild_id, now).await;
                if let Err(e) = &result {
                    error!(target: SWEEP_TARGET, guild_id, error = %e, "Failed to schedule birthday check");
                }
                let _ = reply.send(result);
            }
            TimedActionRequest::Cancel { id, reply } => {
                let result = cancel(&stores, &id).await;
                if let Err(e) = &result {
                    error!(target: SWEEP_TARGET, record_id = %id, error = %e, "Failed to cancel timed record");
                }
                let _ = reply.send(result);
            }
            TimedActionRequest::Shutdown => break,
        }
    }

    info!(target: SWEEP_TARGET, "Timed action worker stopped");
}

async fn cancel(stores: &FeatureStores, id: &str) -> Result<bool, StoreError> {
    match stores.find(id) {
        Some(record) => stores.for_kind(record.kind).remove(id).await,
        None => Ok(false),
    }
}
