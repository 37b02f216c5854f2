//! Core data model for a single replication.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReplicationError;

/// Infix separating a final key from the unique suffix of its temporary object.
pub const TEMP_INFIX: &str = ".__tmp__";

/// A replication request as received from the notification forwarder.
///
/// `key` is still in the upstream wire encoding (percent and `+` encoded);
/// see [`crate::key::decode_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    /// Source container (bucket).
    pub container: String,
    /// Raw, possibly encoded object key.
    pub key: String,
}

impl ReplicationRequest {
    /// Create a new request.
    #[must_use]
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }
}

/// Opaque per-object generation token (ETag, generation number, mtime).
///
/// Used to make an overwrite conditional on the destination object still
/// being the one that was inspected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    /// Wrap a store-specific token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Describes an object in either store. Derived from a lookup, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// SHA-256 digest, when the store can provide one without reading data.
    pub checksum: Option<Bytes>,
    /// Store generation token, when the store exposes one.
    pub version: Option<ObjectVersion>,
}

impl ObjectDescriptor {
    /// Create a descriptor carrying only key and size.
    #[must_use]
    pub fn new(key: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            key: key.into(),
            size_bytes,
            checksum: None,
            version: None,
        }
    }

    /// Attach a SHA-256 digest.
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<Bytes>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Attach a generation token.
    #[must_use]
    pub fn with_version(mut self, version: ObjectVersion) -> Self {
        self.version = Some(version);
        self
    }
}

/// Names the staging object owned by exactly one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempObjectHandle {
    /// The key the object becomes visible under after promotion.
    pub final_key: String,
    /// `final_key + ".__tmp__" + unique suffix`.
    pub temp_key: String,
}

impl TempObjectHandle {
    /// Allocate a fresh temporary name for `final_key`.
    ///
    /// Two calls for the same final key never produce the same temporary key.
    #[must_use]
    pub fn new(final_key: impl Into<String>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::with_suffix(final_key, &suffix)
    }

    /// Build a handle with an explicit suffix.
    #[must_use]
    pub fn with_suffix(final_key: impl Into<String>, suffix: &str) -> Self {
        let final_key = final_key.into();
        let temp_key = format!("{final_key}{TEMP_INFIX}{suffix}");
        Self {
            final_key,
            temp_key,
        }
    }
}

/// Whether `key` names a temporary object.
#[must_use]
pub fn is_temp_key(key: &str) -> bool {
    key.contains(TEMP_INFIX)
}

/// Condition under which a promote may make the temporary object visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The final key must not exist (generation-zero).
    DoesNotExist,
    /// The final key must still hold exactly this generation.
    MatchesVersion(ObjectVersion),
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoesNotExist => f.write_str("does-not-exist"),
            Self::MatchesVersion(v) => write!(f, "matches-version({v})"),
        }
    }
}

/// How a commit resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitResolution {
    /// This transfer's temporary object became the final object.
    Promoted,
    /// A concurrent transfer had already promoted the final object.
    ConflictAlreadyExists,
}

impl CommitResolution {
    /// Lowercase name used in logs and response bodies.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promoted => "promoted",
            Self::ConflictAlreadyExists => "conflict_already_exists",
        }
    }
}

impl fmt::Display for CommitResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single externally observable result of a replication request.
#[derive(Debug)]
pub enum TransferOutcome {
    /// The final object exists and matches the source.
    Completed {
        /// Decoded key.
        key: String,
        /// Bytes streamed by this request.
        bytes_transferred: u64,
        /// Whether this request or a concurrent one promoted the object.
        resolution: CommitResolution,
    },
    /// The destination already held a matching object; nothing was transferred.
    Skipped {
        /// Decoded key.
        key: String,
        /// Size of the existing object.
        size_bytes: u64,
    },
    /// The request failed.
    Failed(ReplicationError),
}

impl TransferOutcome {
    /// Whether the outcome is `Completed` or `Skipped`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    /// Short status label.
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Skipped { .. } => "skipped",
            Self::Failed(_) => "failed",
        }
    }
}

/// Internal per-request state machine. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Request validated and key decoded.
    Validated,
    /// Decider chose to skip.
    DecidedSkip,
    /// Decider chose to proceed.
    DecidedProceed,
    /// Chunks are being pumped to the temporary object.
    Streaming,
    /// The temporary object is complete.
    TempWritten,
    /// The promote is in progress.
    Committing,
    /// Terminal: final object in place.
    Completed,
    /// Terminal: skipped without transfer.
    Skipped,
    /// Terminal: failed.
    Failed,
}

impl TransferState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        use TransferState::{
            Committing, Completed, DecidedProceed, DecidedSkip, Failed, Skipped, Streaming,
            TempWritten, Validated,
        };

        matches!(
            (self, next),
            (Validated, DecidedSkip | DecidedProceed | Failed)
                | (DecidedSkip, Skipped)
                | (DecidedProceed, Streaming)
                | (Streaming, TempWritten | Failed)
                | (TempWritten, Committing)
                | (Committing, Completed | Failed)
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validated => "validated",
            Self::DecidedSkip => "decided_skip",
            Self::DecidedProceed => "decided_proceed",
            Self::Streaming => "streaming",
            Self::TempWritten => "temp_written",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
