//! The replication entry point.
//!
//! [`Replicator::replicate`] validates the request, canonicalizes the key,
//! and runs decide → transfer → commit. It is the only place where internal
//! results become a [`TransferOutcome`], and it logs exactly one event per
//! terminal transition.
//!
//! ```text
//! Validated ─┬─► DecidedSkip ─► Skipped
//!            ├─► DecidedProceed ─► Streaming ─► TempWritten ─► Committing ─► Completed
//!            └─► Failed ◄──────────────┘                            │
//!                  ▲────────────────────────────────────────────────┘
//! ```
//!
//! Concurrent requests for the same key need no coordination here: the
//! destination's conditional promote picks exactly one winner, and the
//! losers resolve as completed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::commit::{CommitManager, PromoteMode};
use crate::decider::{Decision, FingerprintMode, IdempotencyDecider};
use crate::error::{ReplicationError, ReplicationErrorKind, StoreError};
use crate::executor::{DEFAULT_CHUNK_SIZE, TransferError, TransferExecutor};
use crate::key::decode_key;
use crate::retry::{RetryError, RetryPolicy, classify_store_error};
use crate::store::{DestinationStore, SourceStore};
use crate::types::{
    CommitResolution, ReplicationRequest, TempObjectHandle, TransferOutcome, TransferState,
};

/// Default number of replications allowed to run at once.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 16;

/// Engine tunables.
///
/// # Examples
///
/// ```
/// use blobrelay_core::orchestrator::ReplicatorSettings;
///
/// let settings = ReplicatorSettings::builder().chunk_size(1024).build();
/// assert_eq!(settings.chunk_size, 1024);
/// assert_eq!(settings.concurrency_limit, 16);
/// assert!(settings.request_timeout.is_none());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct ReplicatorSettings {
    /// Bytes per chunk read from the source and written to the temp object.
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Retry policy applied to every store call.
    #[builder(default)]
    pub retry: RetryPolicy,

    /// Skip criterion.
    #[builder(default)]
    pub fingerprint: FingerprintMode,

    /// Commit strategy override.
    #[builder(default)]
    pub promote_mode: PromoteMode,

    /// Maximum replications in flight.
    #[builder(default = DEFAULT_CONCURRENCY_LIMIT)]
    pub concurrency_limit: usize,

    /// Per-request deadline applied by [`Replicator::replicate`].
    #[builder(default)]
    pub request_timeout: Option<Duration>,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How a successful run ended.
enum Finished {
    Skipped {
        size: u64,
    },
    Completed {
        size: u64,
        bytes: u64,
        resolution: CommitResolution,
    },
}

/// Tracks the per-request state machine.
struct Progress<'a> {
    container: &'a str,
    key: &'a str,
    state: TransferState,
}

impl Progress<'_> {
    fn advance(&mut self, next: TransferState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        debug!(
            container = self.container,
            key = self.key,
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
    }
}

/// Replicates single objects from a source store to a destination store.
#[derive(Debug)]
pub struct Replicator {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    decider: IdempotencyDecider,
    executor: TransferExecutor,
    commit: CommitManager,
    retry: RetryPolicy,
    permits: Semaphore,
    concurrency_limit: usize,
    request_timeout: Option<Duration>,
}

impl Replicator {
    /// Assemble an engine over the given stores.
    #[must_use]
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        settings: ReplicatorSettings,
    ) -> Self {
        let limit = settings.concurrency_limit.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            source,
            destination,
            decider: IdempotencyDecider::new(
                settings.fingerprint,
                settings.chunk_size,
                settings.retry.clone(),
            ),
            executor: TransferExecutor::new(settings.chunk_size, settings.retry.clone()),
            commit: CommitManager::new(settings.retry.clone(), settings.promote_mode),
            retry: settings.retry,
            permits: Semaphore::new(limit),
            concurrency_limit: limit,
            request_timeout: settings.request_timeout,
        }
    }

    /// The destination store.
    #[must_use]
    pub fn destination(&self) -> &Arc<dyn DestinationStore> {
        &self.destination
    }

    /// Maximum replications in flight.
    #[must_use]
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Replicate one object using the configured request timeout.
    pub async fn replicate(&self, request: &ReplicationRequest) -> TransferOutcome {
        let deadline = self.request_timeout.map(|t| Instant::now() + t);
        self.replicate_with_deadline(request, deadline).await
    }

    /// Replicate one object, aborting the transfer at the first chunk
    /// boundary past `deadline`.
    pub async fn replicate_with_deadline(
        &self,
        request: &ReplicationRequest,
        deadline: Option<Instant>,
    ) -> TransferOutcome {
        let started = Instant::now();
        let container = request.container.as_str();

        let key = match validate(request) {
            Ok(key) => key,
            Err(err) => {
                log_failure(container, &request.key, &err, started);
                return TransferOutcome::Failed(err);
            }
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                let err = ReplicationError::Unknown {
                    message: format!("concurrency limiter unavailable: {e}"),
                    source: None,
                };
                log_failure(container, &key, &err, started);
                return TransferOutcome::Failed(err);
            }
        };

        info!(container, key = %key, "replication started");
        let mut progress = Progress {
            container,
            key: &key,
            state: TransferState::Validated,
        };

        match self.run(container, &key, deadline, &mut progress).await {
            Ok(Finished::Skipped { size }) => {
                progress.advance(TransferState::Skipped);
                info!(
                    container,
                    key = %key,
                    size,
                    elapsed_ms = elapsed_ms(started),
                    "replication skipped, destination already up to date"
                );
                TransferOutcome::Skipped {
                    key,
                    size_bytes: size,
                }
            }
            Ok(Finished::Completed {
                size,
                bytes,
                resolution,
            }) => {
                progress.advance(TransferState::Completed);
                info!(
                    container,
                    key = %key,
                    size,
                    bytes,
                    resolution = %resolution,
                    elapsed_ms = elapsed_ms(started),
                    "replication completed"
                );
                TransferOutcome::Completed {
                    key,
                    bytes_transferred: bytes,
                    resolution,
                }
            }
            Err(err) => {
                progress.advance(TransferState::Failed);
                log_failure(container, &key, &err, started);
                TransferOutcome::Failed(err)
            }
        }
    }

    async fn run(
        &self,
        container: &str,
        key: &str,
        deadline: Option<Instant>,
        progress: &mut Progress<'_>,
    ) -> Result<Finished, ReplicationError> {
        let descriptor = self
            .retry
            .execute(|_| self.source.describe(container, key), classify_store_error)
            .await
            .map_err(|e| source_failure(e, container, key))?;

        let decision = self
            .decider
            .decide(
                self.source.as_ref(),
                self.destination.as_ref(),
                container,
                &descriptor,
            )
            .await
            .map_err(destination_failure)?;

        let precondition = match decision {
            Decision::Skip { existing } => {
                progress.advance(TransferState::DecidedSkip);
                return Ok(Finished::Skipped {
                    size: existing.size_bytes,
                });
            }
            Decision::Proceed {
                precondition,
                reason,
            } => {
                progress.advance(TransferState::DecidedProceed);
                debug!(container, key, reason = %reason, "transfer required");
                precondition
            }
        };

        let temp = TempObjectHandle::new(key);
        progress.advance(TransferState::Streaming);
        let bytes = self
            .executor
            .transfer(
                self.source.as_ref(),
                self.destination.as_ref(),
                container,
                &descriptor,
                &temp,
                deadline,
            )
            .await
            .map_err(|e| transfer_failure(e, container, key))?;
        progress.advance(TransferState::TempWritten);

        progress.advance(TransferState::Committing);
        let resolution = self
            .commit
            .commit(self.destination.as_ref(), &temp, &precondition)
            .await
            .map_err(destination_failure)?;

        Ok(Finished::Completed {
            size: descriptor.size_bytes,
            bytes,
            resolution,
        })
    }
}

/// Check required fields and return the canonical key.
fn validate(request: &ReplicationRequest) -> Result<String, ReplicationError> {
    if request.container.is_empty() {
        return Err(ReplicationError::invalid_request("bucket must not be empty"));
    }
    decode_key(&request.key)
}

fn source_failure(err: RetryError<StoreError>, container: &str, key: &str) -> ReplicationError {
    match err {
        RetryError::Exhausted { attempts, last } => ReplicationError::TransientExhausted {
            attempts,
            source: last,
        },
        RetryError::Permanent { error, .. } => ReplicationError::from_store(error, container, key),
    }
}

fn destination_failure(err: RetryError<StoreError>) -> ReplicationError {
    match err {
        RetryError::Exhausted { attempts, last } => ReplicationError::TransientExhausted {
            attempts,
            source: last,
        },
        RetryError::Permanent { error, .. } => ReplicationError::from_destination(error),
    }
}

fn transfer_failure(err: TransferError, container: &str, key: &str) -> ReplicationError {
    match err {
        TransferError::Transient { attempts, source } => {
            ReplicationError::TransientExhausted { attempts, source }
        }
        TransferError::Source(e) => ReplicationError::from_store(e, container, key),
        TransferError::Destination(e) => ReplicationError::from_destination(e),
        TransferError::DeadlineExceeded { bytes_written } => {
            ReplicationError::DeadlineExceeded { bytes_written }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Terminal failure event. `(container, key, timestamp)` is enough to re-drive.
fn log_failure(container: &str, key: &str, err: &ReplicationError, started: Instant) {
    let kind = err.kind();
    let timestamp = Utc::now().to_rfc3339();
    if kind == ReplicationErrorKind::InvalidRequest {
        warn!(
            container,
            key,
            error_kind = %kind,
            error = %err,
            elapsed_ms = elapsed_ms(started),
            timestamp = %timestamp,
            "replication failed"
        );
    } else {
        error!(
            container,
            key,
            error_kind = %kind,
            retryable = kind.is_retryable(),
            error = %err,
            elapsed_ms = elapsed_ms(started),
            timestamp = %timestamp,
            "replication failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PromoteCapability};
    use crate::test_support::FaultyStore;

    const MIB: usize = 1024 * 1024;

    fn settings(chunk_size: usize) -> ReplicatorSettings {
        ReplicatorSettings::builder()
            .chunk_size(chunk_size)
            .retry(RetryPolicy::new(3).with_backoff(Duration::from_millis(50), 2.0))
            .build()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn engine(
        src: Arc<dyn SourceStore>,
        dst: Arc<dyn DestinationStore>,
        settings: ReplicatorSettings,
    ) -> Replicator {
        Replicator::new(src, dst, settings)
    }

    #[tokio::test]
    async fn test_should_complete_then_skip_encoded_key() {
        let src = Arc::new(MemoryStore::new("source-bucket"));
        let dst = Arc::new(MemoryStore::new("replica"));
        src.put_object("source-bucket", "reports/q1 2024.csv", payload(MIB));
        let replicator = engine(src.clone(), dst.clone(), settings(8 * MIB));
        let request = ReplicationRequest::new("source-bucket", "reports/q1+2024.csv");

        let first = replicator.replicate(&request).await;
        match first {
            TransferOutcome::Completed {
                ref key,
                bytes_transferred,
                resolution,
            } => {
                assert_eq!(key, "reports/q1 2024.csv");
                assert_eq!(bytes_transferred, MIB as u64);
                assert_eq!(resolution, CommitResolution::Promoted);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(src.largest_read(), MIB);
        let copied = dst.get_object("replica", "reports/q1 2024.csv").unwrap();
        assert_eq!(copied.len(), MIB);

        let second = replicator.replicate(&request).await;
        assert!(matches!(
            second,
            TransferOutcome::Skipped { size_bytes, .. } if size_bytes == MIB as u64
        ));
        assert_eq!(
            dst.get_object("replica", "reports/q1 2024.csv").unwrap(),
            copied
        );
        assert_eq!(dst.keys("replica"), vec!["reports/q1 2024.csv".to_owned()]);
    }

    #[tokio::test]
    async fn test_should_keep_destination_unchanged_on_rerun() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        src.put_object("src", "k", "payload");
        let replicator = engine(src.clone(), dst.clone(), settings(4));
        let request = ReplicationRequest::new("src", "k");

        assert!(replicator.replicate(&request).await.is_success());
        let before = dst.lookup("k").await.unwrap().unwrap();
        let outcome = replicator.replicate(&request).await;
        let after = dst.lookup("k").await.unwrap().unwrap();

        assert_eq!(outcome.status(), "skipped");
        assert_eq!(before, after);
    }

    async fn concurrent_delivery(capability: PromoteCapability) {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst").with_capability(capability));
        let size = 256 * 1024;
        src.put_object("src", "hot/key.bin", payload(size));
        let replicator = Arc::new(engine(src.clone(), dst.clone(), settings(16 * 1024)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let replicator = Arc::clone(&replicator);
                tokio::spawn(async move {
                    replicator
                        .replicate(&ReplicationRequest::new("src", "hot/key.bin"))
                        .await
                })
            })
            .collect();

        for task in tasks {
            let outcome = task.await.unwrap();
            assert!(outcome.is_success(), "{capability}: {outcome:?}");
        }
        assert_eq!(dst.keys("dst"), vec!["hot/key.bin".to_owned()], "{capability}");
        assert_eq!(
            dst.get_object("dst", "hot/key.bin").unwrap(),
            src.get_object("src", "hot/key.bin").unwrap()
        );
        assert_eq!(dst.pending_uploads(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_should_produce_single_object_under_concurrent_delivery() {
        concurrent_delivery(PromoteCapability::Native).await;
        concurrent_delivery(PromoteCapability::CopyThenDelete).await;
    }

    #[tokio::test]
    async fn test_should_hide_partial_transfer_when_source_vanishes() {
        let inner = MemoryStore::new("src");
        inner.put_object("src", "k", payload(4096));
        let src = Arc::new(FaultyStore::new(inner).with_reads_failing_from(1024));
        let dst = Arc::new(MemoryStore::new("dst"));
        let replicator = engine(src, dst.clone(), settings(512));

        let outcome = replicator.replicate(&ReplicationRequest::new("src", "k")).await;

        match outcome {
            TransferOutcome::Failed(err) => {
                assert_eq!(err.kind(), ReplicationErrorKind::SourceNotFound);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(dst.lookup("k").await.unwrap().is_none());
        // temp left in place for the sweep
        assert_eq!(dst.list_temp_objects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_should_not_stitch_versions_when_source_is_overwritten() {
        let inner = MemoryStore::new("src");
        inner.put_object("src", "k", "AAAAAAAA");
        let src = Arc::new(FaultyStore::new(inner).with_overwrite_after_first_read("BBBBBBBB"));
        let dst = Arc::new(MemoryStore::new("dst"));
        let replicator = engine(src.clone(), dst.clone(), settings(4));
        let request = ReplicationRequest::new("src", "k");

        let outcome = replicator.replicate(&request).await;

        match outcome {
            TransferOutcome::Failed(err) => {
                assert_eq!(err.kind(), ReplicationErrorKind::Unknown);
                assert!(err.to_string().contains("changed"), "{err}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(dst.lookup("k").await.unwrap().is_none());
        // the version mismatch is not retried
        assert_eq!(src.reads(), 2);

        let redelivered = replicator.replicate(&request).await;
        assert_eq!(redelivered.status(), "completed");
        assert_eq!(dst.get_object("dst", "k").unwrap().as_ref(), b"BBBBBBBB");
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_abort_on_deadline_without_visible_object() {
        let inner = MemoryStore::new("src");
        inner.put_object("src", "k", payload(1000));
        let src = Arc::new(FaultyStore::new(inner).with_read_delay(Duration::from_secs(1)));
        let dst = Arc::new(MemoryStore::new("dst"));
        let settings = ReplicatorSettings {
            request_timeout: Some(Duration::from_millis(1500)),
            ..settings(100)
        };
        let replicator = engine(src, dst.clone(), settings);

        let outcome = replicator.replicate(&ReplicationRequest::new("src", "k")).await;

        match outcome {
            TransferOutcome::Failed(ReplicationError::DeadlineExceeded { bytes_written }) => {
                assert_eq!(bytes_written, 200);
            }
            other => panic!("expected deadline failure, got {other:?}"),
        }
        assert!(dst.lookup("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_bound_chunk_size_independent_of_object_size() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        src.put_object("src", "big", payload(4 * MIB));
        let replicator = engine(src.clone(), dst.clone(), settings(64 * 1024));

        let outcome = replicator.replicate(&ReplicationRequest::new("src", "big")).await;

        assert!(outcome.is_success());
        assert_eq!(src.largest_read(), 64 * 1024);
        assert_eq!(dst.largest_write(), 64 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_recover_from_fewer_faults_than_attempts() {
        let inner = MemoryStore::new("src");
        inner.put_object("src", "k", "abc");
        let src = Arc::new(FaultyStore::new(inner).with_read_faults(2));
        let dst = Arc::new(MemoryStore::new("dst"));
        let replicator = engine(src.clone(), dst.clone(), settings(16));

        let outcome = replicator.replicate(&ReplicationRequest::new("src", "k")).await;

        assert_eq!(outcome.status(), "completed");
        assert_eq!(src.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_report_exhaustion_when_faults_reach_attempts() {
        let inner = MemoryStore::new("src");
        inner.put_object("src", "k", "abc");
        let src = Arc::new(FaultyStore::new(inner).with_read_faults(3));
        let dst = Arc::new(MemoryStore::new("dst"));
        let replicator = engine(src.clone(), dst.clone(), settings(16));

        let outcome = replicator.replicate(&ReplicationRequest::new("src", "k")).await;

        match outcome {
            TransferOutcome::Failed(err) => {
                assert_eq!(err.kind(), ReplicationErrorKind::TransientExhausted);
                assert!(err.kind().is_retryable());
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(src.reads(), 3);
    }

    #[tokio::test]
    async fn test_should_reject_invalid_requests_before_store_access() {
        let src = Arc::new(FaultyStore::new(MemoryStore::new("src")));
        let dst = Arc::new(MemoryStore::new("dst"));
        let replicator = engine(src.clone(), dst, settings(16));

        for (container, key) in [("", "k"), ("src", ""), ("src", "bad%FFkey")] {
            let outcome = replicator
                .replicate(&ReplicationRequest::new(container, key))
                .await;
            match outcome {
                TransferOutcome::Failed(err) => {
                    assert_eq!(err.kind(), ReplicationErrorKind::InvalidRequest);
                }
                other => panic!("expected rejection, got {other:?}"),
            }
        }
        assert_eq!(src.reads(), 0);
    }

    #[tokio::test]
    async fn test_should_map_missing_source_and_denied_access() {
        let dst = Arc::new(MemoryStore::new("dst"));
        let missing = engine(
            Arc::new(MemoryStore::new("src")),
            dst.clone(),
            settings(16),
        );
        let outcome = missing.replicate(&ReplicationRequest::new("src", "gone")).await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed(ReplicationError::SourceNotFound { .. })
        ));

        let denied = engine(
            Arc::new(FaultyStore::new(MemoryStore::new("src")).with_denied_reads()),
            dst,
            settings(16),
        );
        let outcome = denied.replicate(&ReplicationRequest::new("src", "k")).await;
        assert!(matches!(
            outcome,
            TransferOutcome::Failed(ReplicationError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_should_replace_stale_object_of_different_size() {
        let src = Arc::new(MemoryStore::new("src"));
        let dst = Arc::new(MemoryStore::new("dst"));
        src.put_object("src", "k", "complete object");
        dst.put_object("dst", "k", "partial");
        let replicator = engine(src, dst.clone(), settings(4));

        let outcome = replicator.replicate(&ReplicationRequest::new("src", "k")).await;

        assert_eq!(outcome.status(), "completed");
        assert_eq!(
            dst.get_object("dst", "k").unwrap().as_ref(),
            b"complete object"
        );
        assert!(dst.list_temp_objects().await.unwrap().is_empty());
    }

    #[test]
    fn test_should_clamp_concurrency_limit() {
        let replicator = engine(
            Arc::new(MemoryStore::new("src")),
            Arc::new(MemoryStore::new("dst")),
            ReplicatorSettings::builder().concurrency_limit(0).build(),
        );
        assert_eq!(replicator.concurrency_limit(), 1);
    }
}
