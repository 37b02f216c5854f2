//! blobrelay forwarder: turns an S3 event notification into replication requests.
//!
//! Reads one notification document from the file named by the first argument,
//! or from stdin, and issues exactly one `POST /v1/replicate` per record. Keys
//! are forwarded in their notification encoding; the server decodes them.
//! Nothing is retried here. A failed record is logged and makes the process
//! exit non-zero so the delivering system can re-drive it.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `REPLICATE_URL` | `http://127.0.0.1:8080` |
//! | `LOG_LEVEL` | `info` |
//! | `RUST_LOG` | *(unset)*, overrides `LOG_LEVEL` |

mod event;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::event::{ForwardedRequest, extract_requests};

/// Default server base URL.
const DEFAULT_REPLICATE_URL: &str = "http://127.0.0.1:8080";

/// Initialize the tracing subscriber.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}

/// The replicate endpoint under `base`.
fn endpoint(base: &str) -> String {
    format!("{}/v1/replicate", base.trim_end_matches('/'))
}

/// Read the notification document from `path` or stdin.
async fn read_document(path: Option<&str>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {path}")),
        None => {
            let mut document = String::new();
            tokio::io::stdin()
                .read_to_string(&mut document)
                .await
                .context("cannot read stdin")?;
            Ok(document)
        }
    }
}

/// Send one request. Returns whether the server reported success.
async fn forward(client: &reqwest::Client, url: &str, request: &ForwardedRequest) -> bool {
    let response = match client.post(url).json(request).send().await {
        Ok(response) => response,
        Err(e) => {
            error!(bucket = %request.bucket, key = %request.key, error = %e, "request failed");
            return false;
        }
    };

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        info!(bucket = %request.bucket, key = %request.key, %status, response = %body, "replication accepted");
        true
    } else {
        error!(bucket = %request.bucket, key = %request.key, %status, response = %body, "replication failed");
        false
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    init_tracing(&log_level)?;

    let base = std::env::var("REPLICATE_URL").unwrap_or_else(|_| DEFAULT_REPLICATE_URL.to_owned());
    let url = endpoint(&base);

    let path = std::env::args().nth(1);
    let document = read_document(path.as_deref()).await?;
    let extracted = extract_requests(&document)?;

    let client = reqwest::Client::new();
    let mut failed = 0usize;
    for entry in &extracted {
        match entry {
            Ok(request) => {
                if !forward(&client, &url, request).await {
                    failed += 1;
                }
            }
            Err(reason) => {
                warn!(%reason, "skipping unusable record");
                failed += 1;
            }
        }
    }

    info!(records = extracted.len(), failed, "notification forwarded");
    if failed > 0 {
        anyhow::bail!("{failed} of {} records were not replicated", extracted.len());
    }
    Ok(())
}
