//! Method and path routing plus transport-level errors.

use http::{Method, StatusCode};

/// Path of the replication endpoint.
pub const REPLICATE_PATH: &str = "/v1/replicate";

/// Path of the health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// A resolved endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `GET /health`.
    Health,
    /// `POST /v1/replicate`.
    Replicate,
}

/// A request rejected before it reached the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HttpError {
    /// Response status.
    pub status: StatusCode,
    /// Short error code placed in the `error` field.
    pub code: &'static str,
    /// Human-readable detail.
    pub message: String,
}

impl HttpError {
    /// Build an error.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// Malformed request body.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidRequest", message)
    }

    /// Body exceeded the configured limit.
    #[must_use]
    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "InvalidRequest",
            format!("request body exceeds {limit} bytes"),
        )
    }

    /// Unknown path.
    #[must_use]
    pub fn not_found(path: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", format!("no route for {path}"))
    }

    /// Known path, wrong method.
    #[must_use]
    pub fn method_not_allowed(method: &Method, path: &str) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            format!("{method} is not allowed on {path}"),
        )
    }

    /// Failure reading the request body.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "UnknownFailure", message)
    }
}

/// Resolve the endpoint for `method` and `path`.
///
/// # Errors
///
/// Returns 404 for unknown paths and 405 for a known path with the wrong method.
pub fn resolve_route(method: &Method, path: &str) -> Result<Route, HttpError> {
    let route = match path.trim_end_matches('/') {
        HEALTH_PATH => Route::Health,
        REPLICATE_PATH => Route::Replicate,
        _ => return Err(HttpError::not_found(path)),
    };
    let allowed = match route {
        Route::Health => method == Method::GET || method == Method::HEAD,
        Route::Replicate => method == Method::POST,
    };
    if allowed {
        Ok(route)
    } else {
        Err(HttpError::method_not_allowed(method, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_resolve_known_routes() {
        assert_eq!(resolve_route(&Method::GET, "/health").unwrap(), Route::Health);
        assert_eq!(
            resolve_route(&Method::POST, "/v1/replicate").unwrap(),
            Route::Replicate
        );
        assert_eq!(
            resolve_route(&Method::POST, "/v1/replicate/").unwrap(),
            Route::Replicate
        );
    }

    #[test]
    fn test_should_reject_wrong_method_and_unknown_path() {
        let err = resolve_route(&Method::GET, "/v1/replicate").unwrap_err();
        assert_eq!(err.status, StatusCode::METHOD_NOT_ALLOWED);

        let err = resolve_route(&Method::POST, "/v2/replicate").unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
