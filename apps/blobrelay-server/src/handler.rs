//! Bridges the HTTP layer to the replication engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use blobrelay_core::{ReplicationRequest, Replicator, TransferOutcome};
use blobrelay_http::ReplicationHandler;

/// Wrapper that implements [`ReplicationHandler`] by delegating to [`Replicator`].
#[derive(Debug, Clone)]
pub struct ReplicatorHandler(pub Arc<Replicator>);

impl ReplicationHandler for ReplicatorHandler {
    fn replicate(
        &self,
        request: ReplicationRequest,
    ) -> Pin<Box<dyn Future<Output = TransferOutcome> + Send>> {
        let replicator = Arc::clone(&self.0);
        Box::pin(async move { replicator.replicate(&request).await })
    }
}
