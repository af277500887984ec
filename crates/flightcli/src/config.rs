use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use flightcache::CacheConfig;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
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
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::WARN,
            format: LogFormat::Auto,
            enable_backtraces: true,
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
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "flightcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Controls the simulated database used by the `records` command.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// How long establishing a connection takes.
    #[serde(with = "humantime_serde")]
    pub connect_latency: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            connect_latency: Duration::from_millis(250),
        }
    }
}

/// The configuration of `flightcli`, usually read from a YAML file.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configures the logger.
    pub logging: Logging,

    /// Configures the metrics service.
    pub metrics: Metrics,

    /// Configures the caches of the clients.
    ///
    /// Each client uses this as a template, and names its cache after itself.
    pub cache: CacheConfig,

    /// The base URL of the users service.
    pub users_url: Option<Url>,

    /// Configures the simulated database.
    pub database: DatabaseConfig,
}

impl Config {
    /// Loads the config from the YAML file at `path`, or returns the default config.
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

    /// Returns the cache config for the client with the given `name`.
    pub fn cache_for(&self, name: &str) -> CacheConfig {
        CacheConfig {
            name: name.to_owned(),
            ..self.cache.clone()
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::WARN);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
        assert_eq!(cfg.cache, CacheConfig::default());
        assert_eq!(cfg.users_url, None);
        assert_eq!(cfg.database.connect_latency, Duration::from_millis(250));
        assert_eq!(cfg.metrics.prefix, "flightcache");
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            metrics:
              prefix: flights
              custom_tags:
                region: eu
            cache:
              retention: 5m
              spawn_loaders: false
            users_url: http://localhost:3000/api/
            database:
              connect_latency: 1s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();

        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);
        assert_eq!(cfg.metrics.prefix, "flights");
        assert_eq!(cfg.metrics.custom_tags["region"], "eu");
        assert_eq!(
            cfg.users_url.as_ref().map(Url::as_str),
            Some("http://localhost:3000/api/")
        );
        assert_eq!(cfg.database.connect_latency, Duration::from_secs(1));

        let users = cfg.cache_for("users");
        assert_eq!(users.name, "users");
        assert_eq!(users.retention, Some(Duration::from_secs(300)));
        assert!(!users.spawn_loaders);
    }

    #[test]
    fn test_config_file() {
        let dir = flightcache_test::tempdir();
        let path = dir.path().join("flightcli.yml");
        fs::write(&path, "users_url: http://127.0.0.1:3000/\ncache:\n  retention: 1m\n").unwrap();

        let cfg = Config::get(Some(&path)).unwrap();
        assert!(cfg.users_url.is_some());
        assert_eq!(cfg.cache.retention, Some(Duration::from_secs(60)));

        let missing = dir.path().join("missing.yml");
        assert!(Config::get(Some(&missing)).is_err());
    }

    #[test]
    fn test_invalid_config() {
        assert!(Config::from_reader("".as_bytes()).is_err());

        let yaml = r#"
            logging:
              level: loud
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "failed to parse config YAML");
    }
}
