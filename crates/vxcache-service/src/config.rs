use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other).
    Auto,
    /// With colors.
    Pretty,
    /// Simplified log output.
    Simplified,
    /// Dump out JSON lines.
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the service.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Controls reporting of metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance. Metrics are disabled when unset.
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: None,
            prefix: "vxcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Size and retention limits for the cache.
///
/// The size relations (`max_entry_size_mb` and `low_water_mb` must not
/// exceed `max_size_mb`, `entry_expiration` must be positive) are enforced
/// when the cache manager is constructed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheParams {
    /// Hard limit on the summed size of all payloads, in mebibytes.
    pub max_size_mb: u64,

    /// Limit on the size of any single payload, in mebibytes.
    pub max_entry_size_mb: u64,

    /// Once over the hard limit, eviction frees space down to this target,
    /// in mebibytes. Keeping it below the limit avoids evicting again on
    /// every subsequent write.
    pub low_water_mb: u64,

    /// Entries not written for this long are treated as absent and their
    /// files reclaimed.
    #[serde(with = "humantime_serde")]
    pub entry_expiration: Duration,

    /// Whether pins placed by a previous process should be lifted on
    /// startup.
    ///
    /// The entry table does not survive restarts, so no pins do either;
    /// the option is accepted for compatibility with existing platform
    /// configurations.
    pub unlock_on_start: bool,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            max_size_mb: 200,
            max_entry_size_mb: 20,
            low_water_mb: 180,
            entry_expiration: Duration::from_secs(3600),
            unlock_on_start: true,
        }
    }
}

/// Service configuration, loaded from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the cache writes its payload files into. Created if it
    /// does not exist.
    pub cache_dir: PathBuf,

    /// Size and retention limits.
    pub caches: CacheParams,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("cache"),
            caches: CacheParams::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or the defaults when no path
    /// is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
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
