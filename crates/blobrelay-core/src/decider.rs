//! Idempotency decision: does the destination already hold this object?
//!
//! The default fingerprint is the object size, which costs one metadata
//! lookup. [`FingerprintMode::SizeAndChecksum`] additionally requires equal
//! SHA-256 digests, reading both objects when a store cannot supply a digest
//! from metadata.
//!
//! A `Proceed` decision carries the [`Precondition`] the commit must use: an
//! absent final object is promoted under "does not exist", a stale one under
//! "still the version we saw". Either way a concurrent winner surfaces as a
//! precondition failure at commit time rather than being overwritten.

use std::fmt;
use std::future::Future;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::checksums::digest_chunks;
use crate::error::StoreError;
use crate::retry::{RetryError, RetryPolicy, classify_store_error};
use crate::store::{DestinationStore, SourceStore};
use crate::types::{ObjectDescriptor, Precondition};

/// What counts as "the same object".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    /// Equal size is enough.
    #[default]
    Size,
    /// Equal size and equal SHA-256.
    SizeAndChecksum,
}

/// Why a transfer is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProceedReason {
    /// The final key does not exist.
    Absent,
    /// The final key holds an object of a different size.
    SizeMismatch {
        /// Size of the object currently at the final key.
        existing_size: u64,
    },
    /// Sizes match but digests differ.
    ChecksumMismatch,
    /// Sizes match but a digest could not be obtained.
    ChecksumUnavailable,
}

impl fmt::Display for ProceedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::SizeMismatch { existing_size } => write!(f, "size mismatch (existing {existing_size})"),
            Self::ChecksumMismatch => f.write_str("checksum mismatch"),
            Self::ChecksumUnavailable => f.write_str("checksum unavailable"),
        }
    }
}

/// Outcome of [`IdempotencyDecider::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The destination already holds a matching object.
    Skip {
        /// The matching destination object.
        existing: ObjectDescriptor,
    },
    /// A transfer is required.
    Proceed {
        /// Condition the commit must enforce.
        precondition: Precondition,
        /// Why.
        reason: ProceedReason,
    },
}

impl Decision {
    /// Whether the decision is [`Decision::Skip`].
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }
}

/// Precondition that protects whatever currently sits at the final key.
fn precondition_for(existing: &ObjectDescriptor) -> Precondition {
    match &existing.version {
        Some(version) => Precondition::MatchesVersion(version.clone()),
        None => {
            warn!(
                key = %existing.key,
                "destination exposes no object version, stale object cannot be replaced"
            );
            Precondition::DoesNotExist
        }
    }
}

/// Size-only decision.
///
/// # Examples
///
/// ```
/// use blobrelay_core::decider::decide_by_size;
/// use blobrelay_core::types::ObjectDescriptor;
///
/// let source = ObjectDescriptor::new("k", 10);
/// assert!(!decide_by_size(&source, None).is_skip());
/// assert!(decide_by_size(&source, Some(&ObjectDescriptor::new("k", 10))).is_skip());
/// assert!(!decide_by_size(&source, Some(&ObjectDescriptor::new("k", 9))).is_skip());
/// ```
#[must_use]
pub fn decide_by_size(source: &ObjectDescriptor, existing: Option<&ObjectDescriptor>) -> Decision {
    match existing {
        None => Decision::Proceed {
            precondition: Precondition::DoesNotExist,
            reason: ProceedReason::Absent,
        },
        Some(existing) if existing.size_bytes == source.size_bytes => Decision::Skip {
            existing: existing.clone(),
        },
        Some(existing) => Decision::Proceed {
            precondition: precondition_for(existing),
            reason: ProceedReason::SizeMismatch {
                existing_size: existing.size_bytes,
            },
        },
    }
}

/// Decides Skip or Proceed for one request.
#[derive(Debug, Clone)]
pub struct IdempotencyDecider {
    mode: FingerprintMode,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl IdempotencyDecider {
    /// Create a decider. `chunk_size` bounds reads done for checksum fingerprints.
    #[must_use]
    pub fn new(mode: FingerprintMode, chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            mode,
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    /// The configured fingerprint mode.
    #[must_use]
    pub fn mode(&self) -> FingerprintMode {
        self.mode
    }

    /// Look up the final key and decide.
    ///
    /// # Errors
    ///
    /// Returns the retry error if the destination lookup fails. Failures while
    /// computing checksums never error; they force `Proceed`.
    pub async fn decide(
        &self,
        source_store: &dyn SourceStore,
        destination: &dyn DestinationStore,
        container: &str,
        source: &ObjectDescriptor,
    ) -> Result<Decision, RetryError<StoreError>> {
        let existing = self
            .retry
            .execute(|_| destination.lookup(&source.key), classify_store_error)
            .await?;

        let existing = match decide_by_size(source, existing.as_ref()) {
            Decision::Skip { existing } => existing,
            proceed => return Ok(proceed),
        };
        if self.mode == FingerprintMode::Size {
            return Ok(Decision::Skip { existing });
        }

        let source_digest = match &source.checksum {
            Some(digest) => Ok(digest.clone()),
            None => {
                self.digest(source.size_bytes, |offset, len| {
                    source_store.read_chunk(container, &source.key, source.version.as_ref(), offset, len)
                })
                .await
            }
        };
        let existing_digest = match &existing.checksum {
            Some(digest) => Ok(digest.clone()),
            None => {
                self.digest(existing.size_bytes, |offset, len| {
                    destination.read_chunk(&existing.key, offset, len)
                })
                .await
            }
        };

        let precondition = precondition_for(&existing);
        match (source_digest, existing_digest) {
            (Ok(a), Ok(b)) if a == b => {
                debug!(key = %source.key, "checksums match");
                Ok(Decision::Skip { existing })
            }
            (Ok(_), Ok(_)) => Ok(Decision::Proceed {
                precondition,
                reason: ProceedReason::ChecksumMismatch,
            }),
            (Err(e), _) | (_, Err(e)) => {
                warn!(key = %source.key, error = %e, "could not compute checksum fingerprint");
                Ok(Decision::Proceed {
                    precondition,
                    reason: ProceedReason::ChecksumUnavailable,
                })
            }
        }
    }

    async fn digest<F, Fut>(&self, size: u64, read: F) -> Result<Bytes, StoreError>
    where
        F: Fn(u64, usize) -> Fut,
        Fut: Future<Output = Result<Bytes, StoreError>>,
    {
        let read = &read;
        digest_chunks(size, self.chunk_size, |offset, len| async move {
            self.retry
                .execute(|_| read(offset, len), classify_store_error)
                .await
                .map_err(RetryError::into_inner)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn decider(mode: FingerprintMode) -> IdempotencyDecider {
        IdempotencyDecider::new(mode, 4, RetryPolicy::new(1))
    }

    #[tokio::test]
    async fn test_should_proceed_when_destination_absent() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("src", "k", "hello");
        let desc = src.describe("src", "k").await.unwrap();

        let decision = decider(FingerprintMode::Size)
            .decide(&src, &dst, "src", &desc)
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Proceed {
                precondition: Precondition::DoesNotExist,
                reason: ProceedReason::Absent,
            }
        );
    }

    #[tokio::test]
    async fn test_should_skip_on_equal_size() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("src", "k", "hello");
        dst.put_object("dst", "k", "HELLO");
        let desc = src.describe("src", "k").await.unwrap();

        let decision = decider(FingerprintMode::Size)
            .decide(&src, &dst, "src", &desc)
            .await
            .unwrap();
        assert!(decision.is_skip());
    }

    #[tokio::test]
    async fn test_should_guard_stale_object_with_its_version() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("src", "k", "hello");
        dst.put_object("dst", "k", "hel");
        let desc = src.describe("src", "k").await.unwrap();
        let existing = dst.lookup("k").await.unwrap().unwrap();

        let decision = decider(FingerprintMode::Size)
            .decide(&src, &dst, "src", &desc)
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::Proceed {
                precondition: Precondition::MatchesVersion(existing.version.unwrap()),
                reason: ProceedReason::SizeMismatch { existing_size: 3 },
            }
        );
    }

    #[tokio::test]
    async fn test_should_detect_same_size_corruption_in_checksum_mode() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("src", "k", "hello");
        dst.put_object("dst", "k", "HELLO");
        let desc = src.describe("src", "k").await.unwrap();

        let decision = decider(FingerprintMode::SizeAndChecksum)
            .decide(&src, &dst, "src", &desc)
            .await
            .unwrap();
        assert!(matches!(
            decision,
            Decision::Proceed {
                reason: ProceedReason::ChecksumMismatch,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_should_stream_digest_when_descriptor_lacks_checksum() {
        let src = MemoryStore::new("src");
        let dst = MemoryStore::new("dst");
        src.put_object("src", "k", "hello world");
        dst.put_object("dst", "k", "hello world");
        let mut desc = src.describe("src", "k").await.unwrap();
        desc.checksum = None;

        let decision = decider(FingerprintMode::SizeAndChecksum)
            .decide(&src, &dst, "src", &desc)
            .await
            .unwrap();
        assert!(decision.is_skip());
        assert_eq!(src.largest_read(), 4);
    }
}
