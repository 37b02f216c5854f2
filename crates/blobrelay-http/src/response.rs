//! Outcome serialization and status mapping.

use blobrelay_core::{
    CommitResolution, ReplicationErrorKind, ReplicationRequest, TransferOutcome,
};
use bytes::Bytes;
use http::{HeaderValue, StatusCode, header};
use http_body_util::Full;
use serde::Serialize;
use tracing::error;

use crate::router::HttpError;

/// Response type produced by the service.
pub type RelayResponse = http::Response<Full<Bytes>>;

/// Content type of every non-empty response.
pub const CONTENT_TYPE: &str = "application/json";

/// Header carrying the per-request correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Success body of `POST /v1/replicate`.
#[derive(Debug, Serialize)]
struct ReplicateResponse<'a> {
    status: &'static str,
    bucket: &'a str,
    key: &'a str,
    bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<CommitResolution>,
}

/// Error body.
///
/// ```json
/// { "error": "SourceNotFound", "message": "...", "bucket": "b", "key": "k" }
/// ```
#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    bucket: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct HealthResponse<'a> {
    status: &'static str,
    version: &'a str,
}

/// HTTP status for a failure kind.
#[must_use]
pub fn status_for(kind: ReplicationErrorKind) -> StatusCode {
    match kind {
        ReplicationErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ReplicationErrorKind::SourceNotFound => StatusCode::NOT_FOUND,
        ReplicationErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ReplicationErrorKind::TransientExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ReplicationErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render the engine's outcome for `request`.
#[must_use]
pub fn outcome_to_response(outcome: &TransferOutcome, request: &ReplicationRequest) -> RelayResponse {
    let bucket = request.container.as_str();
    match outcome {
        TransferOutcome::Completed {
            key,
            bytes_transferred,
            resolution,
        } => json_response(
            StatusCode::OK,
            &ReplicateResponse {
                status: outcome.status(),
                bucket,
                key,
                bytes: *bytes_transferred,
                size: None,
                resolution: Some(*resolution),
            },
        ),
        TransferOutcome::Skipped { key, size_bytes } => json_response(
            StatusCode::OK,
            &ReplicateResponse {
                status: outcome.status(),
                bucket,
                key,
                bytes: 0,
                size: Some(*size_bytes),
                resolution: None,
            },
        ),
        TransferOutcome::Failed(err) => {
            let kind = err.kind();
            json_response(
                status_for(kind),
                &ErrorResponse {
                    error: kind.as_str(),
                    message: err.to_string(),
                    bucket: Some(bucket),
                    key: Some(request.key.as_str()),
                },
            )
        }
    }
}

/// Render a transport-level rejection.
#[must_use]
pub fn http_error_response(err: &HttpError) -> RelayResponse {
    json_response(
        err.status,
        &ErrorResponse {
            error: err.code,
            message: err.message.clone(),
            bucket: None,
            key: None,
        },
    )
}

/// `{"status":"running","version":..}`.
#[must_use]
pub fn health_response(version: &str) -> RelayResponse {
    json_response(
        StatusCode::OK,
        &HealthResponse {
            status: "running",
            version,
        },
    )
}

/// Serialize `value` with `status`.
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> RelayResponse {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(json) => (status, Bytes::from(json)),
        Err(e) => {
            error!(error = %e, "failed to serialize response body");
            (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
        }
    };

    let mut response = http::Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
    response
}

#[cfg(test)]
mod tests {
    use blobrelay_core::ReplicationError;
    use http_body_util::BodyExt;

    use super::*;

    async fn body_json(response: RelayResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_should_render_completed_outcome() {
        let request = ReplicationRequest::new("b", "reports/q1+2024.csv");
        let outcome = TransferOutcome::Completed {
            key: "reports/q1 2024.csv".into(),
            bytes_transferred: 1_048_576,
            resolution: CommitResolution::Promoted,
        };
        let response = outcome_to_response(&outcome, &request);
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["key"], "reports/q1 2024.csv");
        assert_eq!(json["bytes"], 1_048_576);
        assert_eq!(json["resolution"], "promoted");
    }

    #[tokio::test]
    async fn test_should_render_skipped_outcome() {
        let request = ReplicationRequest::new("b", "k");
        let outcome = TransferOutcome::Skipped {
            key: "k".into(),
            size_bytes: 42,
        };
        let json = body_json(outcome_to_response(&outcome, &request)).await;
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["bytes"], 0);
        assert_eq!(json["size"], 42);
        assert!(json.get("resolution").is_none());
    }

    #[tokio::test]
    async fn test_should_render_failure_with_correlation_fields() {
        let request = ReplicationRequest::new("b", "a+b");
        let outcome = TransferOutcome::Failed(ReplicationError::SourceNotFound {
            container: "b".into(),
            key: "a b".into(),
        });
        let response = outcome_to_response(&outcome, &request);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(response).await;
        assert_eq!(json["error"], "SourceNotFound");
        assert_eq!(json["bucket"], "b");
        assert_eq!(json["key"], "a+b");
    }

    #[test]
    fn test_should_map_every_kind_to_distinct_status() {
        assert_eq!(status_for(ReplicationErrorKind::InvalidRequest), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ReplicationErrorKind::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(ReplicationErrorKind::TransientExhausted),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ReplicationErrorKind::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status_for(ReplicationErrorKind::Unknown),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
