//! Change Broadcasting
//!
//! Periodic change detection over operational state, plus the publishing
//! path shared by automatic and manual broadcasts.
//!
//! ## Architecture
//!
//! - **ChangeBroadcaster**: fixed-interval tick, snapshot diffing, completion tracking
//! - **StateSource**: read-only state access ([`MemorySource`], [`JsonFileSource`])
//! - **Publisher**: remote send plus local emit, and the `broadcast_*` wrappers
//! - **payload**: canonical per-entity payloads

mod broadcaster;
mod error;
pub mod payload;
mod publisher;
mod snapshot;
mod source;

pub use broadcaster::{BroadcasterConfig, ChangeBroadcaster, TickReport};
pub use error::{BroadcastError, BroadcastResult, SourceError, SourceResult};
pub use publisher::{Publisher, RemoteSink};
pub use snapshot::{CompletedSet, SnapshotCache};
pub use source::{
    Building, InventoryItem, JsonFileSource, MemorySource, StateDocument, StateSource, Task,
    TaskStatus, Worker,
};

#[cfg(test)]
pub(crate) use publisher::recording;
