//! Service configuration loaded from the environment.
//!
//! The environment is read exactly once, at startup, into an immutable
//! [`ServiceConfig`]. Every component receives the parts it needs from that
//! value; nothing reads `std::env` after startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::ingest::{DEFAULT_MAX_ARCHIVE_BYTES, DEFAULT_MAX_UNPACKED_BYTES};

/// Default number of audits that may run at the same time.
const DEFAULT_CONCURRENT_AUDITS: usize = 5;

/// Default maximum number of messages fetched per poll.
const DEFAULT_BATCH_SIZE: usize = 10;

/// Reporting API settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TideConfig {
    /// API key used to request a bearer token.
    pub id: String,
    /// API secret used to request a bearer token.
    pub secret: String,
    /// Full URL of the auth endpoint.
    pub auth_endpoint: String,
    /// API host, e.g. `tide.local`.
    pub host: String,
    /// `http` or `https`.
    pub protocol: String,
    /// API version path segment, e.g. `v1`.
    pub version: String,
}

impl TideConfig {
    /// Base URL of the reporting API (`{protocol}://{host}/api/tide/{version}`).
    pub fn api_base(&self) -> String {
        format!(
            "{}://{}/api/tide/{}",
            self.protocol,
            self.host.trim_end_matches('/'),
            self.version
        )
    }
}

/// Queue provider settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Connection URL; credentials are embedded in the URL.
    pub url: String,
    /// Queue name. Only required in service mode.
    pub name: String,
    /// Maximum number of messages fetched by one poll.
    pub batch_size: usize,
    /// How long a single poll may block waiting for a message.
    pub wait: Duration,
}

/// Object storage settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Root directory that holds buckets.
    pub root: PathBuf,
    /// Bucket that receives this service's artifacts.
    pub bucket: String,
}

/// Analysis tool and per-job scratch settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// Path or name of the phpcs executable.
    pub binary: PathBuf,
    /// Coding standard passed to `--standard`.
    pub standard: String,
    /// Comma separated extensions passed to `--extensions`.
    pub extensions: String,
    /// Largest source archive accepted, in bytes.
    pub max_archive_bytes: u64,
    /// Largest size an archive may expand to, in bytes.
    pub max_unpacked_bytes: u64,
    /// Root under which each job's source is unpacked.
    pub ingest_temp_folder: PathBuf,
    /// Root under which each job's analysis scratch space is created.
    pub temp_folder: PathBuf,
}

/// Poll loop pacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    /// Delay between polls after an empty batch or a transient error.
    pub interval: Duration,
    /// Delay applied after the provider reports a quota/throttle error.
    pub quota_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            quota_backoff: Duration::from_millis(30_000),
        }
    }
}

/// Complete, validated configuration of the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub tide: TideConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub analysis: AnalysisConfig,
    pub poll: PollSettings,
    /// Size of the Concurrency Gate.
    pub max_concurrent_audits: usize,
}

impl ServiceConfig {
    /// Creates configuration from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `TIDE_API_KEY`, `TIDE_API_SECRET`, `TIDE_API_AUTH_URL` (required)
    /// - `TIDE_API_HOST` (required), `TIDE_API_PROTOCOL` (default: https),
    ///   `TIDE_API_VERSION` (default: v1)
    /// - `PHPCS_REDIS_URL` (default: redis://127.0.0.1:6379)
    /// - `PHPCS_QUEUE_NAME`, `PHPCS_QUEUE_BATCH_SIZE` (default: 10),
    ///   `PHPCS_QUEUE_WAIT_SECS` (default: 1)
    /// - `PHPCS_STORAGE_PATH` (default: ./storage), `PHPCS_STORAGE_BUCKET` (required)
    /// - `PHPCS_CONCURRENT_AUDITS` (default: 5)
    /// - `PHPCS_INGEST_TEMP_FOLDER` (default: /tmp/ingest),
    ///   `PHPCS_TEMP_FOLDER` (default: /tmp/phpcs)
    /// - `PHPCS_BINARY` (default: phpcs), `PHPCS_STANDARD` (default: WordPress)
    /// - `PHPCS_POLL_INTERVAL_MS` (default: 1000),
    ///   `PHPCS_QUOTA_BACKOFF_MS` (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let tide = TideConfig {
            id: required("TIDE_API_KEY")?,
            secret: required("TIDE_API_SECRET")?,
            auth_endpoint: required("TIDE_API_AUTH_URL")?,
            host: required("TIDE_API_HOST")?,
            protocol: get("TIDE_API_PROTOCOL").unwrap_or_else(|| "https".to_string()),
            version: get("TIDE_API_VERSION").unwrap_or_else(|| "v1".to_string()),
        };

        let mut queue = QueueConfig {
            url: get("PHPCS_REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            name: get("PHPCS_QUEUE_NAME").unwrap_or_default(),
            batch_size: DEFAULT_BATCH_SIZE,
            wait: Duration::from_secs(1),
        };
        if let Some(val) = get("PHPCS_QUEUE_BATCH_SIZE") {
            queue.batch_size = parse_env_value(&val, "PHPCS_QUEUE_BATCH_SIZE")?;
        }
        if let Some(val) = get("PHPCS_QUEUE_WAIT_SECS") {
            queue.wait = Duration::from_secs(parse_env_value(&val, "PHPCS_QUEUE_WAIT_SECS")?);
        }

        let storage = StorageConfig {
            root: PathBuf::from(get("PHPCS_STORAGE_PATH").unwrap_or_else(|| "./storage".to_string())),
            bucket: required("PHPCS_STORAGE_BUCKET")?,
        };

        let analysis = AnalysisConfig {
            binary: PathBuf::from(get("PHPCS_BINARY").unwrap_or_else(|| "phpcs".to_string())),
            standard: get("PHPCS_STANDARD").unwrap_or_else(|| "WordPress".to_string()),
            extensions: get("PHPCS_EXTENSIONS").unwrap_or_else(|| "php".to_string()),
            max_archive_bytes: match get("PHPCS_MAX_ARCHIVE_BYTES") {
                Some(val) => parse_env_value(&val, "PHPCS_MAX_ARCHIVE_BYTES")?,
                None => DEFAULT_MAX_ARCHIVE_BYTES,
            },
            max_unpacked_bytes: match get("PHPCS_MAX_UNPACKED_BYTES") {
                Some(val) => parse_env_value(&val, "PHPCS_MAX_UNPACKED_BYTES")?,
                None => DEFAULT_MAX_UNPACKED_BYTES,
            },
            ingest_temp_folder: PathBuf::from(
                get("PHPCS_INGEST_TEMP_FOLDER").unwrap_or_else(|| "/tmp/ingest".to_string()),
            ),
            temp_folder: PathBuf::from(
                get("PHPCS_TEMP_FOLDER").unwrap_or_else(|| "/tmp/phpcs".to_string()),
            ),
        };

        let mut poll = PollSettings::default();
        if let Some(val) = get("PHPCS_POLL_INTERVAL_MS") {
            poll.interval = Duration::from_millis(parse_env_value(&val, "PHPCS_POLL_INTERVAL_MS")?);
        }
        if let Some(val) = get("PHPCS_QUOTA_BACKOFF_MS") {
            poll.quota_backoff =
                Duration::from_millis(parse_env_value(&val, "PHPCS_QUOTA_BACKOFF_MS")?);
        }

        let max_concurrent_audits = match get("PHPCS_CONCURRENT_AUDITS") {
            Some(val) => parse_env_value(&val, "PHPCS_CONCURRENT_AUDITS")?,
            None => DEFAULT_CONCURRENT_AUDITS,
        };

        let config = Self {
            tide,
            queue,
            storage,
            analysis,
            poll,
            max_concurrent_audits,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_audits == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_audits must be greater than 0".to_string(),
            ));
        }

        if self.queue.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue batch_size must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.tide.protocol.as_str(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "TIDE_API_PROTOCOL".to_string(),
                message: format!("expected 'http' or 'https', got '{}'", self.tide.protocol),
            });
        }

        if self.poll.quota_backoff < self.poll.interval {
            return Err(ConfigError::ValidationFailed(
                "quota backoff must not be shorter than the poll interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks the settings only service mode needs.
    pub fn require_queue(&self) -> Result<(), ConfigError> {
        if self.queue.name.is_empty() {
            return Err(ConfigError::MissingEnvVar("PHPCS_QUEUE_NAME".to_string()));
        }
        Ok(())
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
