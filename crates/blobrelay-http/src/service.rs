//! Replication HTTP service implementing the hyper `Service` trait.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use tracing::{Instrument, debug, info_span};

use crate::handler::ReplicationHandler;
use crate::request::parse_replicate_body;
use crate::response::{
    CONTENT_TYPE, REQUEST_ID_HEADER, RelayResponse, health_response, http_error_response,
    outcome_to_response,
};
use crate::router::{HttpError, Route, resolve_route};

/// Default upper bound on a request body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

/// Configuration for the replication HTTP service.
#[derive(Debug, Clone)]
pub struct RelayHttpConfig {
    /// Version reported by the health endpoint.
    pub version: String,
    /// Request bodies larger than this are rejected with 413.
    pub max_body_bytes: usize,
}

impl Default for RelayHttpConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Hyper `Service` for the replication endpoint.
///
/// Wraps a [`ReplicationHandler`] and routes `POST /v1/replicate` to it.
/// `GET /health` is answered without touching the handler.
#[derive(Debug)]
pub struct RelayHttpService<H: ReplicationHandler> {
    handler: Arc<H>,
    config: Arc<RelayHttpConfig>,
}

impl<H: ReplicationHandler> RelayHttpService<H> {
    /// Create a new `RelayHttpService`.
    pub fn new(handler: Arc<H>, config: RelayHttpConfig) -> Self {
        Self {
            handler,
            config: Arc::new(config),
        }
    }
}

impl<H: ReplicationHandler> Clone for RelayHttpService<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            config: Arc::clone(&self.config),
        }
    }
}

impl<H: ReplicationHandler> hyper::service::Service<http::Request<Incoming>>
    for RelayHttpService<H>
{
    type Response = RelayResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<Incoming>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let config = Arc::clone(&self.config);
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("request", request_id = %request_id);

        Box::pin(
            async move {
                let response = process_request(req, handler.as_ref(), &config).await;
                Ok(add_common_headers(response, &request_id))
            }
            .instrument(span),
        )
    }
}

/// Run one request through routing, body decoding and the handler.
pub async fn process_request<H, B>(
    req: http::Request<B>,
    handler: &H,
    config: &RelayHttpConfig,
) -> RelayResponse
where
    H: ReplicationHandler,
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();

    let route = match resolve_route(&parts.method, parts.uri.path()) {
        Ok(route) => route,
        Err(err) => {
            debug!(method = %parts.method, path = parts.uri.path(), status = %err.status, "request rejected");
            return http_error_response(&err);
        }
    };

    match route {
        Route::Health => health_response(&config.version),
        Route::Replicate => {
            let bytes = match collect_body(body, config.max_body_bytes).await {
                Ok(bytes) => bytes,
                Err(err) => return http_error_response(&err),
            };
            let request = match parse_replicate_body(&bytes) {
                Ok(request) => request,
                Err(err) => return http_error_response(&err),
            };
            let outcome = handler.replicate(request.clone()).await;
            outcome_to_response(&outcome, &request)
        }
    }
}

/// Collect the body, refusing anything past `limit` bytes.
async fn collect_body<B>(body: B, limit: usize) -> Result<Bytes, HttpError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(HttpError::payload_too_large(limit))
        }
        Err(e) => Err(HttpError::internal(format!(
            "failed to read request body: {e}"
        ))),
    }
}

/// Add common response headers to every response.
fn add_common_headers(mut response: RelayResponse, request_id: &str) -> RelayResponse {
    let headers = response.headers_mut();

    if let Ok(hv) = http::HeaderValue::from_str(request_id) {
        headers.entry(REQUEST_ID_HEADER).or_insert(hv);
    }

    headers
        .entry(http::header::CONTENT_TYPE)
        .or_insert(http::HeaderValue::from_static(CONTENT_TYPE));

    headers.insert(
        http::header::SERVER,
        http::HeaderValue::from_static("blobrelay"),
    );

    response
}
