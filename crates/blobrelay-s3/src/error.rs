//! SDK failure classification.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use blobrelay_core::{StoreError, StoreErrorKind};

/// Map an S3 error code and HTTP status onto a store error kind.
///
/// The code wins when it is recognized; otherwise the status decides.
#[must_use]
pub fn classify(status: Option<u16>, code: Option<&str>) -> StoreErrorKind {
    match code {
        Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound") => {
            return StoreErrorKind::NotFound;
        }
        Some(
            "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable" | "Throttling"
            | "ThrottlingException" | "RequestTimeTooSkewed",
        ) => return StoreErrorKind::Transient,
        Some(
            "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
            | "InvalidToken",
        ) => return StoreErrorKind::PermissionDenied,
        Some("PreconditionFailed" | "ConditionalRequestConflict") => {
            return StoreErrorKind::PreconditionFailed;
        }
        _ => {}
    }

    match status {
        Some(401 | 403) => StoreErrorKind::PermissionDenied,
        Some(404) => StoreErrorKind::NotFound,
        Some(409 | 412) => StoreErrorKind::PreconditionFailed,
        Some(408 | 429) => StoreErrorKind::Transient,
        Some(s) if s >= 500 => StoreErrorKind::Transient,
        Some(400 | 411 | 413 | 416) => StoreErrorKind::InvalidInput,
        _ => StoreErrorKind::Other,
    }
}

/// Classify an SDK failure.
pub(crate) fn kind_of<E>(err: &SdkError<E, HttpResponse>) -> StoreErrorKind
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) => StoreErrorKind::Transient,
        SdkError::DispatchFailure(failure) if failure.is_user() => StoreErrorKind::InvalidInput,
        SdkError::DispatchFailure(_) => StoreErrorKind::Transient,
        SdkError::ConstructionFailure(_) => StoreErrorKind::InvalidInput,
        _ => classify(
            err.raw_response().map(|r| r.status().as_u16()),
            err.code(),
        ),
    }
}

/// Convert an SDK failure, prefixing the message with `context`.
pub(crate) fn store_error<E>(err: &SdkError<E, HttpResponse>, context: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    StoreError::new(
        kind_of(err),
        format!("{context}: {}", DisplayErrorContext(err)),
    )
}
