use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty on a terminal, simplified otherwise.
    Auto,
    /// Multi-line and colored.
    Pretty,
    /// One line per event, no colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

/// Logging options of the client and the CLI.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level of the client.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// How log lines are rendered.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::WARN,
            format: LogFormat::Auto,
        }
    }
}

/// Where statsd metrics are reported to.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server, metrics are off without it.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// Tags attached to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "storefront".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Where and how to reach the admin API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// The base URL all request paths are resolved against.
    pub base_url: String,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a whole request, including reading the response body.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/api/".into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Options for the in-memory response cache and the request coalescer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a cached read is served after it was written.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// The maximum number of cached responses.
    pub capacity: u64,

    /// The time after which an in-flight request fails for all of its coalesced callers.
    ///
    /// Set to `null` to wait indefinitely.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            capacity: 10_000,
            request_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Options for the bearer token lifecycle.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Path of the endpoint exchanging credentials for a token pair.
    pub login_path: String,
    /// Path of the endpoint checking whether an access token is still accepted.
    pub validate_path: String,
    /// Path of the endpoint exchanging a refresh token for a new token pair.
    pub refresh_path: String,

    /// A token whose estimated expiry is closer than this is considered expiring.
    #[serde(with = "humantime_serde")]
    pub expiry_buffer: Duration,

    /// Skips the validation round trip for tokens that are far from their estimated expiry.
    pub trust_expiry: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_path: "auth/login".into(),
            validate_path: "auth/validate".into(),
            refresh_path: "auth/refresh".into(),
            expiry_buffer: Duration::from_secs(5 * 60),
            trust_expiry: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The admin API.
    pub api: ApiConfig,

    /// The response cache.
    pub cache: CacheConfig,

    /// The token lifecycle.
    pub auth: AuthConfig,

    /// The file the session tokens are persisted to.
    ///
    /// Tokens are only kept in memory when this is not set.
    pub session_file: Option<PathBuf>,

    pub logging: Logging,

    pub metrics: Metrics,

    /// Sentry DSN that errors of the client are reported to.
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api: ApiConfig::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
            session_file: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
