use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;

/// The output format of [`init_logging`](crate::logging::init_logging).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when attached to a terminal, `simplified` otherwise.
    #[default]
    Auto,
    /// Multi-line, colored output.
    Pretty,
    /// One line per event, without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

/// Process-wide logging.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The most verbose level logged by this crate.
    ///
    /// One of `off`, `error`, `warn`, `info`, `debug` or `trace`. Overridden by `RUST_LOG`.
    #[serde(with = "level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Log a backtrace for every panic, including panics of loaders.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::default(),
            enable_backtraces: true,
        }
    }
}

/// Reporting of cache metrics to statsd.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Metrics are disabled if this is not set.
    ///
    /// Defaults to the `STATSD_SERVER` environment variable.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// Tags attached to every metric, in addition to the `cache` tag.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "lazycache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// What happens to outstanding work when a cache is stopped.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// Lets loads that are already in flight finish and notify their waiters before shutting
    /// down. New lookups are rejected right away.
    #[default]
    Drain,
    /// Fails all waiters immediately. Loads that finish afterwards are released on the spot.
    Abort,
}

/// Tuning of a single [`Cache`](crate::Cache) instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The name of the cache, used to tag metrics.
    pub name: String,

    /// An identifier of this cache instance for diagnostics.
    ///
    /// A random UUID is used if none is given.
    pub instance_id: Option<String>,

    /// How often entries are checked for expiry.
    ///
    /// Defaults to `1m`.
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// How long an entry may stay unused before it is evicted.
    ///
    /// Every access to an entry resets this.
    ///
    /// Defaults to `10m`.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// The timeout for all operations except `load`, which takes an explicit timeout.
    ///
    /// Defaults to `30s`.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// The number of pending requests the cache worker buffers before callers have to wait.
    ///
    /// Defaults to `1024`.
    pub queue_size: usize,

    /// What happens to outstanding work on [`stop`](crate::Cache::stop).
    pub stop_policy: StopPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            instance_id: None,
            check_interval: Duration::from_secs(60),
            ttl: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
            queue_size: 1024,
            stop_policy: StopPolicy::Drain,
        }
    }
}

/// Configuration of a process running a cache.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub logging: Logging,
    pub metrics: Metrics,
}

impl Config {
    /// Loads the configuration from the YAML file at `path`, or returns the defaults.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents)
    }

    fn from_yaml(contents: &str) -> Result<Self> {
        // serde_yaml parses an empty document as `null`, which is rejected with a confusing error
        if contents.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(contents).context("failed to parse config YAML")
    }
}

mod level_filter {
    use serde::de::{Deserialize, Deserializer, Error, Unexpected};
    use tracing::level_filters::LevelFilter;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        level.parse().map_err(|_| {
            D::Error::invalid_value(
                Unexpected::Str(&level),
                &"one of off, error, warn, info, debug or trace",
            )
        })
    }
}
