//! Replication request body decoding.

use blobrelay_core::ReplicationRequest;
use serde::Deserialize;

use crate::router::HttpError;

/// JSON body of `POST /v1/replicate`.
///
/// `s3_bucket` / `s3_key` are accepted as aliases. Missing fields decode as
/// empty strings so that the engine reports them as an invalid request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicateBody {
    /// Source container.
    #[serde(default, alias = "s3_bucket")]
    pub bucket: String,
    /// Key in the notification's wire encoding.
    #[serde(default, alias = "s3_key")]
    pub key: String,
}

impl From<ReplicateBody> for ReplicationRequest {
    fn from(body: ReplicateBody) -> Self {
        Self::new(body.bucket, body.key)
    }
}

/// Decode a request body.
///
/// # Errors
///
/// Returns a 400 [`HttpError`] if the body is empty or not a JSON object.
pub fn parse_replicate_body(body: &[u8]) -> Result<ReplicationRequest, HttpError> {
    if body.is_empty() {
        return Err(HttpError::invalid_request("request body is empty"));
    }
    let parsed: ReplicateBody = serde_json::from_slice(body)
        .map_err(|e| HttpError::invalid_request(format!("malformed JSON body: {e}")))?;
    Ok(parsed.into())
}
