//! Error types for the timed-record engine

use super::RecordKind;
use thiserror::Error;

/// Persistence failures from an `ExpiryStore` backend
///
/// These always reach the caller. A dropped temp-ban record would leave the
/// user banned forever with no recorded expiry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded
    #[error("Failed to serialize records: {0}")]
    Serialize(String),

    /// The backing file holds data that is not a record list
    #[error("Failed to deserialize records: {0}")]
    Deserialize(String),

    /// The record was rejected before reaching storage
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// The backend refused the write for another reason
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures while sweeping due records
#[derive(Debug, Error)]
pub enum SweepError {
    /// A handler exceeded its time bound
    #[error("Handler for {kind} record {id} timed out")]
    HandlerTimeout { id: String, kind: RecordKind },

    /// A handler reported a failure
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Nothing is registered for this kind
    #[error("No handler registered for record kind: {0}")]
    NoHandler(RecordKind),

    /// The store could not apply the outcome
    #[error(transparent)]
    Persistence(#[from] StoreError),

    /// The sweeper was configured with a zero cadence or timeout
    #[error("Invalid sweeper configuration: {0}")]
    InvalidCadence(String),
}

impl From<String> for SweepError {
    fn from(message: String) -> Self {
        Self::Handler(message)
    }
}

/// Result type for sweep handlers
pub type SweepResult<T> = Result<T, SweepError>;
