use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::requests::{LogMode, RetryConfig};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Json,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
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
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "resourcer".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls what happens to requests nobody holds anymore.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// How many released requests are kept around for reuse.
    ///
    /// Once more requests are released, the least recently used one is destroyed.
    pub max_stale: usize,
    /// Whether a fetch that is still running when the last consumer releases the request is
    /// allowed to finish, so the result can be reused.
    pub keep_active_requests_into_stale: bool,
    /// How long a released request may stay unused before it is destroyed.
    ///
    /// `None` keeps it until capacity pressure evicts it.
    #[serde(with = "humantime_serde")]
    pub stale_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_stale: 100,
            keep_active_requests_into_stale: true,
            stale_ttl: None,
        }
    }
}

/// Configures one [`RequestHandler`](crate::requests::RequestHandler).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HandlerConfig {
    /// Identifies the handler in logs and metrics.
    pub name: String,
    pub logging: LogMode,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            name: "requests".into(),
            logging: LogMode::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl HandlerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
    /// Configuration of the request handlers, by name.
    pub handlers: BTreeMap<String, HandlerConfig>,
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

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let mut config: Self =
            serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        for (name, handler) in &mut config.handlers {
            if handler.name.is_empty() || handler.name == HandlerConfig::default().name {
                handler.name = name.clone();
            }
        }
        Ok(config)
    }

    /// The configuration of the handler called `name`, falling back to defaults.
    pub fn handler(&self, name: &str) -> HandlerConfig {
        self.handlers
            .get(name)
            .cloned()
            .unwrap_or_else(|| HandlerConfig::named(name))
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
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
