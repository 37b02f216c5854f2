//! Boundary between the HTTP transport and the replication engine.

use std::future::Future;
use std::pin::Pin;

use blobrelay_core::{ReplicationRequest, TransferOutcome};

/// Trait that the replication provider must implement.
///
/// The handler receives a parsed request with the key still in its wire
/// encoding and resolves to exactly one outcome.
pub trait ReplicationHandler: Send + Sync + 'static {
    /// Replicate one object.
    fn replicate(
        &self,
        request: ReplicationRequest,
    ) -> Pin<Box<dyn Future<Output = TransferOutcome> + Send>>;
}
