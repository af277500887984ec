//! Configuration of a single [`SingleFlightCache`](crate::SingleFlightCache).
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Controls how a [`SingleFlightCache`](crate::SingleFlightCache) behaves.
///
/// All fields have defaults, so a config file only needs to mention the ones it changes:
///
/// ```yaml
/// name: users
/// retention: 10m
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The name of the cache, used to tag metrics and log events.
    pub name: String,

    /// How long a successfully loaded value is kept.
    ///
    /// `None` keeps successes until they are explicitly invalidated. Failures are never kept,
    /// independent of this setting.
    #[serde(with = "humantime_serde")]
    pub retention: Option<Duration>,

    /// Drive loaders on the current tokio runtime.
    ///
    /// When enabled, a loader runs to completion even if nobody awaits its result. Otherwise
    /// it is driven by whichever caller polls it. Without a tokio runtime this has no effect.
    pub spawn_loaders: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: "default".into(),
            retention: None,
            spawn_loaders: true,
        }
    }
}

impl CacheConfig {
    /// Creates the default config with the given `name`.
    pub fn named(name: impl Into<String>) -> Self {
        CacheConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Loads the config from the YAML file at `path`, or returns the default config.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open cache configuration file")?,
            ),
            None => Ok(CacheConfig::default()),
        }
    }

    /// Parses the config from YAML.
    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading cache config")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("cache config empty");
        }
        serde_yaml::from_str(&config).context("failed to parse cache config YAML")
    }
}
