//! Error types for the replication engine.
//!
//! Two layers of errors exist:
//!
//! - [`StoreError`] is produced by store adapters. Each adapter maps its
//!   native failure into a [`StoreErrorKind`], which is the only thing the
//!   retry policy looks at when deciding whether to try again.
//! - [`ReplicationError`] is the terminal failure reported by the
//!   orchestrator. Its [`ReplicationErrorKind`] is what the HTTP layer maps to
//!   a response status.
//!
//! # Usage
//!
//! ```
//! use blobrelay_core::error::{StoreError, StoreErrorKind};
//!
//! let err = StoreError::transient("connection reset by peer");
//! assert_eq!(err.kind, StoreErrorKind::Transient);
//! assert!(err.is_transient());
//! ```

use std::fmt;

/// Classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StoreErrorKind {
    /// The object (or container) does not exist.
    NotFound,
    /// Authentication or authorization failure.
    PermissionDenied,
    /// Timeout, connection reset, 5xx, or throttling. Expected to succeed on retry.
    Transient,
    /// A conditional write was rejected because its precondition did not hold.
    PreconditionFailed,
    /// The request itself is malformed (bad key, bad range).
    InvalidInput,
    /// The store does not implement the requested capability.
    Unsupported,
    /// Anything the adapter could not classify.
    Other,
}

impl StoreErrorKind {
    /// Returns the short kind string used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::Transient => "Transient",
            Self::PreconditionFailed => "PreconditionFailed",
            Self::InvalidInput => "InvalidInput",
            Self::Unsupported => "Unsupported",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by a store adapter.
#[derive(Debug)]
pub struct StoreError {
    /// The failure classification.
    pub kind: StoreErrorKind,
    /// A human-readable message.
    pub message: String,
    /// The underlying adapter error, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl StoreError {
    /// Create a new store error with the given kind and message.
    #[must_use]
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The object does not exist.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, message)
    }

    /// Access was denied.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PermissionDenied, message)
    }

    /// A retryable transport failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transient, message)
    }

    /// A conditional write precondition did not hold.
    #[must_use]
    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PreconditionFailed, message)
    }

    /// The request is malformed.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidInput, message)
    }

    /// The store lacks the capability.
    #[must_use]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unsupported, message)
    }

    /// Unclassified failure.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Other, message)
    }

    /// Whether the retry policy should try again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == StoreErrorKind::Transient
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::NotFound => StoreErrorKind::NotFound,
            ErrorKind::PermissionDenied => StoreErrorKind::PermissionDenied,
            ErrorKind::AlreadyExists => StoreErrorKind::PreconditionFailed,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => StoreErrorKind::InvalidInput,
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => StoreErrorKind::Transient,
            _ => StoreErrorKind::Other,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

/// Externally visible failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ReplicationErrorKind {
    /// Missing or empty container/key, or an undecodable key.
    InvalidRequest,
    /// The source object was absent at read time.
    SourceNotFound,
    /// Transient failures persisted through every retry attempt.
    TransientExhausted,
    /// Authentication or ACL failure on either store.
    PermissionDenied,
    /// The caller's deadline elapsed before the transfer finished.
    DeadlineExceeded,
    /// Anything else.
    Unknown,
}

impl ReplicationErrorKind {
    /// Returns the kind string used in response bodies and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::SourceNotFound => "SourceNotFound",
            Self::TransientExhausted => "TransientExhausted",
            Self::PermissionDenied => "PermissionDenied",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::Unknown => "UnknownFailure",
        }
    }

    /// Whether re-driving the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExhausted | Self::DeadlineExceeded)
    }
}

impl fmt::Display for ReplicationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal replication failure.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The request was rejected before any store was contacted.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// The source object does not exist.
    #[error("source object not found: {container}/{key}")]
    SourceNotFound {
        /// Source container.
        container: String,
        /// Decoded object key.
        key: String,
    },

    /// Every retry attempt failed with a transient error.
    #[error("transient failure persisted after {attempts} attempts: {source}")]
    TransientExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last failure observed.
        #[source]
        source: StoreError,
    },

    /// Access was denied by one of the stores.
    #[error("permission denied: {source}")]
    PermissionDenied {
        /// The store failure.
        #[source]
        source: StoreError,
    },

    /// The caller deadline elapsed at a chunk boundary.
    #[error("deadline exceeded after {bytes_written} bytes")]
    DeadlineExceeded {
        /// Bytes written to the temporary object before the abort.
        bytes_written: u64,
    },

    /// Unclassified failure.
    #[error("replication failed: {message}")]
    Unknown {
        /// Description with context.
        message: String,
        /// The store failure, if one caused it.
        #[source]
        source: Option<StoreError>,
    },
}

impl ReplicationError {
    /// Build an [`ReplicationError::InvalidRequest`].
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// The failure classification.
    #[must_use]
    pub fn kind(&self) -> ReplicationErrorKind {
        match self {
            Self::InvalidRequest { .. } => ReplicationErrorKind::InvalidRequest,
            Self::SourceNotFound { .. } => ReplicationErrorKind::SourceNotFound,
            Self::TransientExhausted { .. } => ReplicationErrorKind::TransientExhausted,
            Self::PermissionDenied { .. } => ReplicationErrorKind::PermissionDenied,
            Self::DeadlineExceeded { .. } => ReplicationErrorKind::DeadlineExceeded,
            Self::Unknown { .. } => ReplicationErrorKind::Unknown,
        }
    }

    /// Map a permanent store failure into the external taxonomy.
    ///
    /// `container` and `key` identify the source object and are used only
    /// when the failure is a not-found on the source side.
    #[must_use]
    pub fn from_store(err: StoreError, container: &str, key: &str) -> Self {
        match err.kind {
            StoreErrorKind::NotFound => Self::SourceNotFound {
                container: container.to_owned(),
                key: key.to_owned(),
            },
            StoreErrorKind::PermissionDenied => Self::PermissionDenied { source: err },
            StoreErrorKind::InvalidInput => Self::InvalidRequest {
                reason: err.message,
            },
            _ => Self::Unknown {
                message: err.message.clone(),
                source: Some(err),
            },
        }
    }

    /// Map a permanent destination failure. A missing object on this side is
    /// never a source-not-found.
    #[must_use]
    pub fn from_destination(err: StoreError) -> Self {
        match err.kind {
            StoreErrorKind::PermissionDenied => Self::PermissionDenied { source: err },
            StoreErrorKind::InvalidInput => Self::InvalidRequest {
                reason: err.message,
            },
            _ => Self::Unknown {
                message: format!("destination: {}", err.message),
                source: Some(err),
            },
        }
    }
}

/// Configuration loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable held an unparseable value.
    #[error("invalid value for {name}: {value}")]
    InvalidValue {
        /// The variable name.
        name: &'static str,
        /// The offending value.
        value: String,
    },

    /// A store location URI was not recognized.
    #[error("unsupported store location: {0}")]
    UnsupportedLocation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_classify_io_errors() {
        let err: StoreError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(err.kind, StoreErrorKind::NotFound);

        let err: StoreError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(err.is_transient());

        let err: StoreError = std::io::Error::from(std::io::ErrorKind::AlreadyExists).into();
        assert_eq!(err.kind, StoreErrorKind::PreconditionFailed);
    }

    #[test]
    fn test_should_map_store_not_found_to_source_not_found() {
        let err = ReplicationError::from_store(StoreError::not_found("gone"), "bucket", "a/b.txt");
        assert_eq!(err.kind(), ReplicationErrorKind::SourceNotFound);
        assert_eq!(err.to_string(), "source object not found: bucket/a/b.txt");
    }

    #[test]
    fn test_should_map_permission_denied() {
        let err = ReplicationError::from_store(StoreError::permission_denied("403"), "b", "k");
        assert_eq!(err.kind(), ReplicationErrorKind::PermissionDenied);
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn test_should_mark_exhausted_as_retryable() {
        let err = ReplicationError::TransientExhausted {
            attempts: 3,
            source: StoreError::transient("timeout"),
        };
        assert!(err.kind().is_retryable());
        assert!(err.to_string().contains("3 attempts"));
    }
}
