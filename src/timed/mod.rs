//! Timed-record engine
//!
//! Features hand time-anchored records to an `ExpiryStore`; a `Sweeper` per
//! feature re-evaluates the store on its own cadence and fires the registered
//! handler exactly once per due occurrence.

mod backend;
mod error;
mod handler;
mod record;
mod store;
mod sweeper;

pub use backend::{MemoryBackend, RecordBackend, YamlFileBackend};
pub use error::{StoreError, StoreResult, SweepError, SweepResult};
pub use handler::{FnHandler, HandlerRegistry, SweepHandler, SweepOutcome};
pub use record::{RecordKind, TimedRecord};
pub use store::ExpiryStore;
pub use sweeper::{SweepRequest, SweepStats, Sweeper, SweeperHandle, TickReport};
