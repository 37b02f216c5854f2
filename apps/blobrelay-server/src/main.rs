//! blobrelay server: replicates objects between blob stores on request.
//!
//! Each `POST /v1/replicate` names one source object. The server copies it to
//! the configured destination in bounded chunks through a temporary object and
//! answers with the outcome. Duplicate and concurrent deliveries are safe.
//!
//! # Usage
//!
//! ```text
//! SOURCE_STORE=file:///srv/source DESTINATION_STORE=s3://replica blobrelay-server
//! ```
//!
//! See [`RelayConfig::from_env`] for every environment variable. `RUST_LOG`
//! overrides `LOG_LEVEL`.

mod handler;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use blobrelay_core::config::{LogFormat, StoreLocation};
use blobrelay_core::store::{DestinationStore, FsStore, MemoryStore, SourceStore};
use blobrelay_core::sweep::OrphanSweeper;
use blobrelay_core::{RelayConfig, Replicator};
use blobrelay_http::{RelayHttpConfig, RelayHttpService, ReplicationHandler};
use blobrelay_s3::{MIN_PART_SIZE, S3ClientOptions, S3Destination, S3Source, build_client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::handler::ReplicatorHandler;

/// Server version reported in health check responses.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to the `LOG_LEVEL` config value.
fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    Ok(())
}

/// The two store roles the engine runs over.
struct Stores {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
}

/// Build the source and destination stores named by the configuration.
///
/// A memory source and a memory destination share one store.
async fn build_stores(config: &RelayConfig) -> Result<Stores> {
    let source_location = config.source_location()?;
    let destination_location = config.destination_location()?;

    let memory = Arc::new(match &destination_location {
        StoreLocation::Memory {
            container: Some(container),
        } => MemoryStore::new(container.clone()),
        _ => MemoryStore::default(),
    });

    let source: Arc<dyn SourceStore> = match source_location {
        StoreLocation::S3 { .. } => {
            let options = S3ClientOptions {
                profile: config.source_credentials.clone(),
                endpoint_url: None,
            };
            Arc::new(S3Source::new(build_client(&options).await))
        }
        StoreLocation::File(root) => Arc::new(FsStore::new(root)),
        StoreLocation::Memory { .. } => Arc::clone(&memory) as Arc<dyn SourceStore>,
    };

    let destination: Arc<dyn DestinationStore> = match destination_location {
        StoreLocation::S3 { bucket } => {
            let bucket = bucket.context("destination bucket required")?;
            check_part_size(config.chunk_size)?;
            let options = S3ClientOptions {
                profile: config.destination_credentials.clone(),
                endpoint_url: config.destination_endpoint_url.clone(),
            };
            Arc::new(S3Destination::new(build_client(&options).await, bucket))
        }
        StoreLocation::File(root) => Arc::new(FsStore::new(root)),
        StoreLocation::Memory { .. } => memory,
    };

    Ok(Stores {
        source,
        destination,
    })
}

/// Multipart uploads reject parts below the S3 minimum.
fn check_part_size(chunk_size: usize) -> Result<()> {
    if chunk_size < MIN_PART_SIZE {
        anyhow::bail!(
            "CHUNK_SIZE_BYTES={chunk_size} is below the S3 minimum part size of {MIN_PART_SIZE}"
        );
    }
    Ok(())
}

/// Start the periodic orphan sweep if it is enabled.
fn spawn_sweeper(
    config: &RelayConfig,
    destination: Arc<dyn DestinationStore>,
) -> Option<tokio::task::JoinHandle<()>> {
    let period = config.sweep_interval()?;
    info!(
        period_secs = period.as_secs(),
        max_age_secs = config.orphan_max_age_secs,
        "starting orphan sweep"
    );
    let sweeper = OrphanSweeper::new(destination, config.orphan_max_age());
    Some(tokio::spawn(sweeper.run_every(period)))
}

/// Run the accept loop, serving connections until `shutdown` resolves.
async fn serve<H: ReplicationHandler>(
    listener: TcpListener,
    service: RelayHttpService<H>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let http = HttpConnBuilder::new(TokioExecutor::new());

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let svc = service.clone();
                let conn = http.serve_connection(TokioIo::new(stream), svc);
                let conn = graceful.watch(conn.into_owned());

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        error!(peer_addr = %peer_addr, error = %e, "connection error");
                    }
                });
            }

            () = &mut shutdown => {
                info!("shutting down gracefully");
                break;
            }
        }
    }

    // In-flight replications finish before the process exits.
    graceful.shutdown().await;
    info!("all connections drained, exiting");

    Ok(())
}

/// Perform a health check by connecting to the gateway and requesting the health endpoint.
///
/// Exits with code 0 if healthy, 1 otherwise.
async fn run_health_check(addr: &str) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("cannot connect to {addr}"))?;

    let (mut reader, mut writer) = stream.into_split();

    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    writer.write_all(request.as_bytes()).await?;
    writer.shutdown().await?;

    let mut response = String::new();
    reader.read_to_string(&mut response).await?;

    if response.contains("200 OK") && response.contains("\"status\":\"running\"") {
        Ok(())
    } else {
        anyhow::bail!("unhealthy response from {addr}")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --health-check flag for Docker HEALTHCHECK.
    if std::env::args().any(|a| a == "--health-check") {
        let config = RelayConfig::from_env().unwrap_or_default();
        let addr = config.gateway_listen.replace("0.0.0.0", "127.0.0.1");
        let healthy = run_health_check(&addr).await.is_ok();
        std::process::exit(i32::from(!healthy));
    }

    let config = RelayConfig::from_env().context("invalid configuration")?;

    init_tracing(&config.log_level, config.log_format)?;

    info!(
        gateway_listen = %config.gateway_listen,
        source = %config.source_store,
        destination = %config.destination_store,
        chunk_size = config.chunk_size,
        max_attempts = config.max_attempts,
        concurrency_limit = config.concurrency_limit,
        promote_mode = %config.promote_mode,
        version = VERSION,
        "starting blobrelay server",
    );

    let stores = build_stores(&config).await?;
    let replicator = Arc::new(Replicator::new(
        stores.source,
        Arc::clone(&stores.destination),
        config.replicator_settings(),
    ));
    let sweeper = spawn_sweeper(&config, stores.destination);

    let http_config = RelayHttpConfig {
        version: VERSION.to_owned(),
        ..RelayHttpConfig::default()
    };
    let service = RelayHttpService::new(Arc::new(ReplicatorHandler(replicator)), http_config);

    let addr: SocketAddr = config
        .gateway_listen
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.gateway_listen))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!(%addr, "listening for connections");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal, draining connections");
    };
    let result = serve(listener, service, shutdown).await;

    if let Some(task) = sweeper {
        task.abort();
    }
    result
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    use super::*;

    async fn post(addr: &str, path: &str, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn file_config(source: &std::path::Path, destination: &std::path::Path) -> RelayConfig {
        RelayConfig::builder()
            .source_store(format!("file://{}", source.display()))
            .destination_store(format!("file://{}", destination.display()))
            .build()
    }

    #[test]
    fn test_should_reject_chunk_below_s3_part_minimum() {
        assert!(check_part_size(1024).is_err());
        assert!(check_part_size(MIN_PART_SIZE).is_ok());
    }

    #[tokio::test]
    async fn test_should_refuse_s3_destination_with_small_chunks() {
        let config = RelayConfig::builder()
            .source_store("memory://".to_owned())
            .destination_store("s3://replica".to_owned())
            .chunk_size(1024)
            .build();
        assert!(build_stores(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_should_build_filesystem_stores() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let stores = build_stores(&file_config(source.path(), destination.path()))
            .await
            .unwrap();
        assert!(stores.destination.lookup("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_not_spawn_sweeper_when_disabled() {
        let destination: Arc<dyn DestinationStore> = Arc::new(MemoryStore::default());
        assert!(spawn_sweeper(&RelayConfig::default(), destination).is_none());
    }

    #[tokio::test]
    async fn test_should_serve_health_and_replicate_until_shutdown() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let object = source.path().join("inbox").join("reports");
        std::fs::create_dir_all(&object).unwrap();
        std::fs::write(object.join("q1 2024.csv"), vec![7u8; 4096]).unwrap();

        let config = file_config(source.path(), destination.path());
        let stores = build_stores(&config).await.unwrap();
        let replicator = Arc::new(Replicator::new(
            stores.source,
            stores.destination,
            config.replicator_settings(),
        ));
        let service = RelayHttpService::new(
            Arc::new(ReplicatorHandler(replicator)),
            RelayHttpConfig::default(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, service, async {
            stopped.await.ok();
        }));

        run_health_check(&addr).await.unwrap();

        let body = r#"{"bucket":"inbox","key":"reports/q1+2024.csv"}"#;
        let response = post(&addr, "/v1/replicate", body).await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("\"status\":\"completed\""), "{response}");
        let copied = std::fs::read(destination.path().join("reports").join("q1 2024.csv")).unwrap();
        assert_eq!(copied.len(), 4096);

        let response = post(&addr, "/v1/replicate", body).await;
        assert!(response.contains("\"status\":\"skipped\""), "{response}");

        let response = post(&addr, "/v1/replicate", r#"{"bucket":"inbox","key":"nope"}"#).await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        stop.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
