//! Relay configuration.
//!
//! Provides [`RelayConfig`], loaded once at startup from environment
//! variables and handed to the engine explicitly. Nothing in the engine reads
//! the environment on its own.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::commit::PromoteMode;
use crate::decider::FingerprintMode;
use crate::error::ConfigError;
use crate::executor::DEFAULT_CHUNK_SIZE;
use crate::orchestrator::{DEFAULT_CONCURRENCY_LIMIT, ReplicatorSettings};
use crate::retry::RetryPolicy;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Where a store lives, parsed from a location URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// `s3://` or `s3://<bucket>`.
    S3 {
        /// Fixed bucket. Required for a destination, absent for a source.
        bucket: Option<String>,
    },
    /// `file:///abs/path`.
    File(PathBuf),
    /// `memory://` or `memory://<container>`.
    Memory {
        /// Destination container name.
        container: Option<String>,
    },
}

impl FromStr for StoreLocation {
    type Err = ConfigError;

    /// # Examples
    ///
    /// ```
    /// use blobrelay_core::config::StoreLocation;
    ///
    /// let loc: StoreLocation = "s3://replica-bucket".parse().unwrap();
    /// assert_eq!(loc, StoreLocation::S3 { bucket: Some("replica-bucket".into()) });
    /// assert!("ftp://nope".parse::<StoreLocation>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || ConfigError::UnsupportedLocation(s.to_owned());
        let (scheme, rest) = s.split_once("://").ok_or_else(unsupported)?;
        let name = rest.trim_end_matches('/');
        let name = (!name.is_empty()).then(|| name.to_owned());

        match scheme.to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3 { bucket: name }),
            "memory" => Ok(Self::Memory { container: name }),
            "file" if rest.starts_with('/') => Ok(Self::File(PathBuf::from(rest))),
            _ => Err(unsupported()),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3 { bucket } => write!(f, "s3://{}", bucket.as_deref().unwrap_or_default()),
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Memory { container } => {
                write!(f, "memory://{}", container.as_deref().unwrap_or_default())
            }
        }
    }
}

/// Relay service configuration.
///
/// # Examples
///
/// ```
/// use blobrelay_core::config::RelayConfig;
///
/// let config = RelayConfig::default();
/// assert_eq!(config.gateway_listen, "0.0.0.0:8080");
/// assert_eq!(config.chunk_size, 8 * 1024 * 1024);
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Bind address for the HTTP entry point.
    #[builder(default = String::from("0.0.0.0:8080"))]
    pub gateway_listen: String,

    /// Log level filter string (e.g. `"info"`, `"debug"`).
    #[builder(default = String::from("info"))]
    pub log_level: String,

    /// Log output format.
    #[builder(default)]
    pub log_format: LogFormat,

    /// Bytes per transfer chunk.
    #[builder(default = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Attempts per store call, including the first.
    #[builder(default = 3)]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[builder(default = 2000)]
    pub backoff_base_ms: u64,

    /// Growth factor between retries.
    #[builder(default = 2.0)]
    pub backoff_multiplier: f64,

    /// Ceiling for a single retry delay, in milliseconds.
    #[builder(default = 30_000)]
    pub backoff_max_ms: u64,

    /// Whether retry delays get random jitter.
    #[builder(default = true)]
    pub jitter: bool,

    /// Maximum replications in flight.
    #[builder(default = DEFAULT_CONCURRENCY_LIMIT)]
    pub concurrency_limit: usize,

    /// Require equal SHA-256 as well as equal size before skipping.
    #[builder(default = false)]
    pub checksum_fingerprint: bool,

    /// Per-request deadline in seconds; `0` disables it.
    #[builder(default = 0)]
    pub request_timeout_secs: u64,

    /// Source store location URI.
    #[builder(default = String::from("s3://"))]
    pub source_store: String,

    /// Destination store location URI.
    #[builder(default = String::from("memory://"))]
    pub destination_store: String,

    /// Credential profile for the source store.
    #[builder(default)]
    pub source_credentials: Option<String>,

    /// Credential profile for the destination store.
    #[builder(default)]
    pub destination_credentials: Option<String>,

    /// Endpoint override for an S3-compatible destination.
    #[builder(default)]
    pub destination_endpoint_url: Option<String>,

    /// Commit strategy.
    #[builder(default)]
    pub promote_mode: PromoteMode,

    /// Orphan sweep period in seconds; `0` disables the sweep.
    #[builder(default = 0)]
    pub sweep_interval_secs: u64,

    /// Age in seconds after which a temporary object is an orphan.
    #[builder(default = 86_400)]
    pub orphan_max_age_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `GATEWAY_LISTEN` | `0.0.0.0:8080` |
    /// | `LOG_LEVEL` | `info` |
    /// | `LOG_FORMAT` | `text` |
    /// | `CHUNK_SIZE_BYTES` | `8388608` |
    /// | `RETRY_ATTEMPTS` | `3` |
    /// | `RETRY_BACKOFF_MS` | `2000` |
    /// | `RETRY_BACKOFF_MULTIPLIER` | `2.0` |
    /// | `RETRY_BACKOFF_MAX_MS` | `30000` |
    /// | `RETRY_JITTER` | `true` |
    /// | `CONCURRENCY_LIMIT` | `16` |
    /// | `CHECKSUM_FINGERPRINT` | `false` |
    /// | `REQUEST_TIMEOUT_SECS` | `0` |
    /// | `SOURCE_STORE` | `s3://` |
    /// | `DESTINATION_STORE` | `memory://` |
    /// | `SOURCE_CREDENTIALS` | unset |
    /// | `DESTINATION_CREDENTIALS` | unset |
    /// | `DESTINATION_ENDPOINT_URL` | unset |
    /// | `PROMOTE_MODE` | `auto` |
    /// | `SWEEP_INTERVAL_SECS` | `0` |
    /// | `ORPHAN_MAX_AGE_SECS` | `86400` |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::default();

        if let Some(v) = vars.get("GATEWAY_LISTEN") {
            config.gateway_listen = v;
        }
        if let Some(v) = vars.get("LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = vars.parse("LOG_FORMAT")? {
            config.log_format = v;
        }
        if let Some(v) = vars.parse::<usize>("CHUNK_SIZE_BYTES")? {
            if v == 0 {
                return Err(invalid("CHUNK_SIZE_BYTES", "0"));
            }
            config.chunk_size = v;
        }
        if let Some(v) = vars.parse::<u32>("RETRY_ATTEMPTS")? {
            config.max_attempts = v.max(1);
        }
        if let Some(v) = vars.parse("RETRY_BACKOFF_MS")? {
            config.backoff_base_ms = v;
        }
        if let Some(v) = vars.parse::<f64>("RETRY_BACKOFF_MULTIPLIER")? {
            if !v.is_finite() || v < 1.0 {
                return Err(invalid("RETRY_BACKOFF_MULTIPLIER", &v.to_string()));
            }
            config.backoff_multiplier = v;
        }
        if let Some(v) = vars.parse("RETRY_BACKOFF_MAX_MS")? {
            config.backoff_max_ms = v;
        }
        if let Some(v) = vars.get("RETRY_JITTER") {
            config.jitter = parse_bool(&v);
        }
        if let Some(v) = vars.parse::<usize>("CONCURRENCY_LIMIT")? {
            if v == 0 {
                return Err(invalid("CONCURRENCY_LIMIT", "0"));
            }
            config.concurrency_limit = v;
        }
        if let Some(v) = vars.get("CHECKSUM_FINGERPRINT") {
            config.checksum_fingerprint = parse_bool(&v);
        }
        if let Some(v) = vars.parse("REQUEST_TIMEOUT_SECS")? {
            config.request_timeout_secs = v;
        }
        if let Some(v) = vars.get("SOURCE_STORE") {
            config.source_store = v;
        }
        if let Some(v) = vars.get("DESTINATION_STORE") {
            config.destination_store = v;
        }
        config.source_credentials = vars.get("SOURCE_CREDENTIALS");
        config.destination_credentials = vars.get("DESTINATION_CREDENTIALS");
        config.destination_endpoint_url = vars.get("DESTINATION_ENDPOINT_URL");
        if let Some(v) = vars.parse("PROMOTE_MODE")? {
            config.promote_mode = v;
        }
        if let Some(v) = vars.parse("SWEEP_INTERVAL_SECS")? {
            config.sweep_interval_secs = v;
        }
        if let Some(v) = vars.parse("ORPHAN_MAX_AGE_SECS")? {
            config.orphan_max_age_secs = v;
        }

        config.source_location()?;
        config.destination_location()?;
        Ok(config)
    }

    /// The retry policy described by the `RETRY_*` settings.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
            .with_backoff(
                Duration::from_millis(self.backoff_base_ms),
                self.backoff_multiplier,
            )
            .with_max_delay(Duration::from_millis(self.backoff_max_ms))
            .with_jitter(self.jitter)
    }

    /// The skip criterion.
    #[must_use]
    pub fn fingerprint_mode(&self) -> FingerprintMode {
        if self.checksum_fingerprint {
            FingerprintMode::SizeAndChecksum
        } else {
            FingerprintMode::Size
        }
    }

    /// Per-request deadline, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    /// Orphan sweep period, if the sweep is enabled.
    #[must_use]
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Age after which a temporary object is an orphan.
    #[must_use]
    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.orphan_max_age_secs)
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn replicator_settings(&self) -> ReplicatorSettings {
        ReplicatorSettings::builder()
            .chunk_size(self.chunk_size)
            .retry(self.retry_policy())
            .fingerprint(self.fingerprint_mode())
            .promote_mode(self.promote_mode)
            .concurrency_limit(self.concurrency_limit)
            .request_timeout(self.request_timeout())
            .build()
    }

    /// Parsed source location.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedLocation`] for unknown URIs.
    pub fn source_location(&self) -> Result<StoreLocation, ConfigError> {
        self.source_store.parse()
    }

    /// Parsed destination location. An S3 destination must name its bucket.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedLocation`] for unknown URIs.
    pub fn destination_location(&self) -> Result<StoreLocation, ConfigError> {
        let location: StoreLocation = self.destination_store.parse()?;
        if matches!(location, StoreLocation::S3 { bucket: None }) {
            return Err(ConfigError::UnsupportedLocation(format!(
                "{} (destination bucket required)",
                self.destination_store
            )));
        }
        Ok(location)
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError> {
        self.get(name)
            .map(|v| v.trim().parse::<T>().map_err(|_| invalid(name, &v)))
            .transpose()
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_owned(),
    }
}

/// Parse a string as a boolean, accepting `"1"` and `"true"` (case-insensitive).
fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
