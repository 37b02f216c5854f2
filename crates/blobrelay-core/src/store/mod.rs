//! Store capability traits and the bundled adapters.
//!
//! The engine never talks to a concrete blob store. It sees a read-only
//! [`SourceStore`] and a [`DestinationStore`] that can stage temporary
//! objects and promote them conditionally.
//!
//! ```text
//!   SourceStore ──read_chunk──► TransferExecutor ──upload_chunk──► DestinationStore
//!                                                                      │
//!                                   CommitManager ──promote_if/copy_if─┘
//! ```
//!
//! Adapters:
//!
//! - [`memory::MemoryStore`]: `DashMap`-backed, both roles, either promote capability.
//! - [`fs::FsStore`]: local directory tree, native promote via hard links.
//! - `blobrelay-s3`: S3 and S3-compatible services.

pub mod fs;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{ObjectDescriptor, ObjectVersion, Precondition};

pub use fs::FsStore;
pub use memory::MemoryStore;

/// Read-only view of the store objects are replicated from.
#[async_trait]
pub trait SourceStore: Send + Sync + fmt::Debug + 'static {
    /// Report size (and optionally checksum) of an object.
    ///
    /// Returns a [`StoreErrorKind::NotFound`](crate::error::StoreErrorKind::NotFound)
    /// error if the object is absent.
    async fn describe(&self, container: &str, key: &str) -> Result<ObjectDescriptor, StoreError>;

    /// Read at most `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at the end of the object. When `version` is
    /// given the read must fail with
    /// [`StoreErrorKind::PreconditionFailed`](crate::error::StoreErrorKind::PreconditionFailed)
    /// if the object no longer has that version, so that chunks of one
    /// transfer never mix two generations of the object.
    async fn read_chunk(
        &self,
        container: &str,
        key: &str,
        version: Option<&ObjectVersion>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, StoreError>;
}

/// How a destination can make a temporary object visible under its final key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromoteCapability {
    /// The store has an atomic conditional rename.
    Native,
    /// The store can only copy with a precondition, then delete the temp.
    CopyThenDelete,
}

impl fmt::Display for PromoteCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::CopyThenDelete => f.write_str("copy-then-delete"),
        }
    }
}

/// Result of a conditional promote or copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteStatus {
    /// The final key now holds the temporary object's bytes.
    Promoted,
    /// The precondition did not hold; the final key was left untouched.
    PreconditionFailed,
}

/// An in-progress temporary object upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadHandle {
    /// The temporary key being written.
    pub temp_key: String,
    /// Store-specific upload identifier (multipart upload ID, staging path).
    pub upload_id: String,
}

/// A temporary object found by [`DestinationStore::list_temp_objects`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempObjectInfo {
    /// The temporary key.
    pub key: String,
    /// When the object (or upload) was created or last modified.
    pub last_modified: DateTime<Utc>,
    /// Set when the temp is an incomplete upload rather than a visible object.
    pub upload_id: Option<String>,
}

/// The store objects are replicated into.
///
/// Upload chunk writes must be idempotent per `index`: re-sending the same
/// chunk after a transient failure replaces, never appends.
#[async_trait]
pub trait DestinationStore: Send + Sync + fmt::Debug + 'static {
    /// Look up an object, returning `None` if it does not exist.
    async fn lookup(&self, key: &str) -> Result<Option<ObjectDescriptor>, StoreError>;

    /// Read at most `len` bytes of an existing object starting at `offset`.
    async fn read_chunk(&self, key: &str, offset: u64, len: usize) -> Result<Bytes, StoreError>;

    /// Start writing a temporary object.
    async fn begin_upload(&self, temp_key: &str) -> Result<UploadHandle, StoreError>;

    /// Write chunk number `index` (zero-based) located at byte `offset`.
    async fn upload_chunk(
        &self,
        upload: &UploadHandle,
        index: u32,
        offset: u64,
        data: Bytes,
    ) -> Result<(), StoreError>;

    /// Seal the temporary object. After this it is readable under its temp key.
    async fn complete_upload(&self, upload: &UploadHandle) -> Result<(), StoreError>;

    /// Which promote strategies the store supports natively.
    fn promote_capability(&self) -> PromoteCapability;

    /// Atomically rename `temp_key` to `final_key` if `precondition` holds.
    async fn promote_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        let _ = (temp_key, final_key, precondition);
        Err(StoreError::unsupported("store has no native conditional rename"))
    }

    /// Copy `temp_key` to `final_key` if `precondition` holds. The temp is kept.
    async fn copy_if(
        &self,
        temp_key: &str,
        final_key: &str,
        precondition: &Precondition,
    ) -> Result<PromoteStatus, StoreError> {
        let _ = (temp_key, final_key, precondition);
        Err(StoreError::unsupported("store has no conditional copy"))
    }

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List every temporary object and incomplete temporary upload.
    async fn list_temp_objects(&self) -> Result<Vec<TempObjectInfo>, StoreError>;

    /// Remove a temporary object or abort an incomplete upload.
    async fn discard_temp(&self, info: &TempObjectInfo) -> Result<(), StoreError> {
        self.delete(&info.key).await
    }
}
