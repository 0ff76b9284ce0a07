//! Configuration for the validator

use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    code::{LengthBounds, Normalizer},
    index::persistent::DEFAULT_PARTITION,
    source::Source,
};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "COUPON_QUORUM_DATA_DIR";
/// File name of the persistent store inside the data directory.
pub const STORE_FILE_NAME: &str = "coupons.redb";
/// Reload sources once an hour by default.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// A code must appear in at least this many sources by default.
pub const DEFAULT_QUORUM_THRESHOLD: usize = 2;

/// Which index backs the validator.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Resident counts rebuilt from the source files and refreshed periodically.
    #[default]
    Volatile,
    /// Point lookups in a pre-built store, one partition per source.
    Persistent,
}

/// A configured code source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Logical name of the source, also its partition name in the persistent store.
    pub name: String,
    /// Gzip compressed, newline-delimited code list.
    pub path: PathBuf,
}

/// Validator configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`], which expects three sources `file1` to `file3` at
/// `data/couponbase{1,2,3}.gz` relative to the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The index backend to use.
    pub backend: Backend,
    /// The code sources, in order.
    pub sources: Vec<SourceConfig>,
    /// How often the volatile backend reloads its sources.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Number of sources a code must appear in to be valid.
    pub quorum_threshold: usize,
    /// Accepted length of a normalized code.
    pub code_length: LengthBounds,
    /// Location of the persistent store.
    ///
    /// Defaults to [`STORE_FILE_NAME`] inside [`Self::data_dir`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

/// A configuration that cannot back a validator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No sources configured.
    #[error("no code sources configured")]
    NoSources,
    /// A quorum of zero would accept anything.
    #[error("quorum threshold must be at least 1")]
    ZeroQuorum,
    /// More sources required than exist.
    #[error("quorum threshold {threshold} exceeds the number of sources ({sources})")]
    QuorumUnreachable {
        /// Configured threshold.
        threshold: usize,
        /// Configured number of sources.
        sources: usize,
    },
    /// Length bounds that no code can satisfy.
    #[error("invalid code length bounds {min}..={max}")]
    InvalidLengthBounds {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A source without a name.
    #[error("source #{0} has an empty name")]
    EmptySourceName(usize),
    /// Two sources with the same name.
    #[error("duplicate source name {0:?}")]
    DuplicateSource(String),
    /// A source named like the default partition.
    #[error("source name {0:?} is reserved")]
    ReservedSourceName(String),
    /// The refresher would spin.
    #[error("refresh interval must not be zero")]
    ZeroRefreshInterval,
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)?;
        Ok(config)
    }

    /// Check that the config can back a validator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }
        if self.quorum_threshold == 0 {
            return Err(ConfigError::ZeroQuorum);
        }
        if self.quorum_threshold > self.sources.len() {
            return Err(ConfigError::QuorumUnreachable {
                threshold: self.quorum_threshold,
                sources: self.sources.len(),
            });
        }
        let LengthBounds { min, max } = self.code_length;
        if min == 0 || min > max {
            return Err(ConfigError::InvalidLengthBounds { min, max });
        }
        let mut names = HashSet::new();
        for (i, source) in self.sources.iter().enumerate() {
            if source.name.is_empty() {
                return Err(ConfigError::EmptySourceName(i));
            }
            if source.name == DEFAULT_PARTITION {
                return Err(ConfigError::ReservedSourceName(source.name.clone()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        if self.sources.len() < 2 {
            warn!("only one code source configured, every code it contains is valid");
        }
        Ok(())
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = if let Some(val) = env::var_os(DATA_DIR_ENV) {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().ok_or_else(|| {
                anyhow!("operating environment provides no directory for application data")
            })?;
            path.join("coupon-quorum")
        };
        Ok(dir)
    }

    /// Get the path to the persistent store.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join(STORE_FILE_NAME)),
        }
    }

    /// The configured sources.
    pub fn sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .enumerate()
            .map(|(i, source)| Source::new(i, source.name.clone(), source.path.clone()))
            .collect()
    }

    /// Partition names of the persistent store, one per source.
    pub fn partition_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }

    /// The normalizer applied at ingestion and query time.
    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.code_length)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            sources: (1..=3)
                .map(|i| SourceConfig {
                    name: format!("file{i}"),
                    path: PathBuf::from(format!("data/couponbase{i}.gz")),
                })
                .collect(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            quorum_threshold: DEFAULT_QUORUM_THRESHOLD,
            code_length: LengthBounds::default(),
            store_path: None,
        }
    }
}
