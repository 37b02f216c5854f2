//! Chunked copy from the source object into a temporary destination object.
//!
//! The loop holds at most one chunk. Every read and every write goes through
//! the [`RetryPolicy`] on its own, so a transient failure only repeats the
//! chunk it hit. An optional deadline is checked between chunks.
//!
//! The executor never deletes its temporary object. Whatever it wrote stays
//! behind on failure and is reclaimed by the orphan sweep.

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::retry::{RetryError, RetryPolicy, classify_store_error};
use crate::store::{DestinationStore, SourceStore, UploadHandle};
use crate::types::{ObjectDescriptor, TempObjectHandle};

/// Default chunk size: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Why a transfer stopped.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// A read or write kept failing transiently until retries ran out.
    #[error("transient failure persisted after {attempts} attempts: {source}")]
    Transient {
        /// Attempts made for the failing chunk operation.
        attempts: u32,
        /// The last failure.
        #[source]
        source: StoreError,
    },

    /// The source failed permanently (denied, vanished, truncated).
    #[error("source read failed: {0}")]
    Source(#[source] StoreError),

    /// The destination failed permanently.
    #[error("destination write failed: {0}")]
    Destination(#[source] StoreError),

    /// The deadline passed at a chunk boundary.
    #[error("deadline exceeded after {bytes_written} bytes")]
    DeadlineExceeded {
        /// Bytes already written to the temporary object.
        bytes_written: u64,
    },
}

impl TransferError {
    /// Whether the transfer may succeed if re-driven later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::DeadlineExceeded { .. })
    }

    fn from_source(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => Self::Transient {
                attempts,
                source: last,
            },
            RetryError::Permanent { error, .. } => Self::Source(error),
        }
    }

    fn from_destination(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => Self::Transient {
                attempts,
                source: last,
            },
            RetryError::Permanent { error, .. } => Self::Destination(error),
        }
    }
}

/// Pumps bytes from a [`SourceStore`] into a temporary object.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    chunk_size: usize,
    retry: RetryPolicy,
}

impl TransferExecutor {
    /// Create an executor. A zero `chunk_size` is treated as one byte.
    #[must_use]
    pub fn new(chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    /// The configured chunk size.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copy `descriptor` from `container` into `temp.temp_key`.
    ///
    /// Returns the number of bytes written. On success the temporary object is
    /// sealed and readable; on failure it is left as it is.
    ///
    /// # Errors
    ///
    /// See [`TransferError`].
    pub async fn transfer(
        &self,
        source: &dyn SourceStore,
        destination: &dyn DestinationStore,
        container: &str,
        descriptor: &ObjectDescriptor,
        temp: &TempObjectHandle,
        deadline: Option<Instant>,
    ) -> Result<u64, TransferError> {
        let upload = self
            .retry
            .execute(|_| destination.begin_upload(&temp.temp_key), classify_store_error)
            .await
            .map_err(TransferError::from_destination)?;
        debug!(temp_key = %upload.temp_key, size = descriptor.size_bytes, "upload started");

        let written = self
            .pump(source, destination, container, descriptor, &upload, deadline)
            .await?;

        self.retry
            .execute(|_| destination.complete_upload(&upload), classify_store_error)
            .await
            .map_err(TransferError::from_destination)?;
        debug!(temp_key = %upload.temp_key, bytes = written, "temporary object sealed");
        Ok(written)
    }

    async fn pump(
        &self,
        source: &dyn SourceStore,
        destination: &dyn DestinationStore,
        container: &str,
        descriptor: &ObjectDescriptor,
        upload: &UploadHandle,
        deadline: Option<Instant>,
    ) -> Result<u64, TransferError> {
        let size = descriptor.size_bytes;
        let mut offset = 0u64;
        let mut index = 0u32;

        while offset < size {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(TransferError::DeadlineExceeded {
                    bytes_written: offset,
                });
            }

            let remaining = size - offset;
            let len = usize::try_from(remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));
            let chunk = self
                .retry
                .execute(
                    |_| {
                        source.read_chunk(
                            container,
                            &descriptor.key,
                            descriptor.version.as_ref(),
                            offset,
                            len,
                        )
                    },
                    classify_store_error,
                )
                .await
                .map_err(TransferError::from_source)?;
            if chunk.is_empty() {
                return Err(TransferError::Source(StoreError::other(format!(
                    "source ended at {offset} bytes, expected {size}"
                ))));
            }

            let chunk_len = chunk.len() as u64;
            self.retry
                .execute(
                    |_| destination.upload_chunk(upload, index, offset, chunk.clone()),
                    classify_store_error,
                )
                .await
                .map_err(TransferError::from_destination)?;

            offset += chunk_len;
            index += 1;
            trace!(temp_key = %upload.temp_key, index, bytes = offset, size, "chunk written");
        }

        Ok(offset)
    }
}
