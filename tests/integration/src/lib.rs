//! Integration tests for the blobrelay server.
//!
//! These tests require a running server backed by filesystem stores, with
//! the test process able to write into the source root and read the
//! destination root:
//!
//! ```text
//! SOURCE_STORE=file:///tmp/relay/src DESTINATION_STORE=file:///tmp/relay/dst blobrelay-server
//! SOURCE_ROOT=/tmp/relay/src DESTINATION_ROOT=/tmp/relay/dst \
//!     cargo test -p blobrelay-integration -- --ignored
//! ```

use std::path::PathBuf;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize tracing (once).
fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

/// Base URL of the server.
#[must_use]
pub fn base_url() -> String {
    std::env::var("BLOBRELAY_URL").unwrap_or_else(|_| "http://localhost:8080".to_owned())
}

/// An HTTP client for the server.
#[must_use]
pub fn http_client() -> reqwest::Client {
    init_tracing();
    reqwest::Client::new()
}

fn root(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

/// Directory the server reads source containers from.
#[must_use]
pub fn source_root() -> PathBuf {
    root("SOURCE_ROOT", "/tmp/relay/src")
}

/// Directory the server writes replicated objects into.
#[must_use]
pub fn destination_root() -> PathBuf {
    root("DESTINATION_ROOT", "/tmp/relay/dst")
}

/// A fresh container name for one test.
#[must_use]
pub fn test_container(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string()[..8].to_owned();
    format!("test-{prefix}-{id}")
}

/// Write a source object under its decoded key and return its path.
pub fn put_source_object(container: &str, key: &str, data: &[u8]) -> PathBuf {
    let path = source_root().join(container).join(key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("failed to create {}: {e}", parent.display()));
    }
    std::fs::write(&path, data).unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    path
}

/// POST a replicate request and return status plus JSON body.
pub async fn replicate(
    client: &reqwest::Client,
    bucket: &str,
    key: &str,
) -> (reqwest::StatusCode, serde_json::Value) {
    let response = client
        .post(format!("{}/v1/replicate", base_url()))
        .json(&serde_json::json!({ "bucket": bucket, "key": key }))
        .send()
        .await
        .expect("replicate request");
    let status = response.status();
    let body = response.json().await.expect("json body");
    (status, body)
}

mod test_health;
mod test_replicate;
