//! Replication engine for copying single objects between blob stores.
//!
//! One request names a source container and an encoded key. The engine
//! decodes the key, decides whether the destination already holds the
//! object, streams it in bounded chunks into a temporary object, and
//! promotes that temporary object to its final key under a precondition.
//!
//! Duplicate and concurrent deliveries of the same request are safe: the
//! destination's conditional promote lets exactly one transfer win, and every
//! other one resolves as completed or skipped.
//!
//! # Modules
//!
//! - [`orchestrator`]: the `replicate` entry point.
//! - [`decider`]: skip or proceed.
//! - [`executor`]: chunked streaming into a temporary object.
//! - [`commit`]: native or emulated conditional promote.
//! - [`retry`]: bounded exponential backoff.
//! - [`store`]: store traits and the in-memory and filesystem adapters.
//! - [`sweep`]: orphaned temporary object cleanup.
//! - [`config`]: environment configuration.

pub mod checksums;
pub mod commit;
pub mod config;
pub mod decider;
pub mod error;
pub mod executor;
pub mod key;
pub mod orchestrator;
pub mod retry;
pub mod store;
pub mod sweep;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::RelayConfig;
pub use error::{ReplicationError, ReplicationErrorKind, StoreError, StoreErrorKind};
pub use orchestrator::{Replicator, ReplicatorSettings};
pub use types::{CommitResolution, ReplicationRequest, TransferOutcome};
