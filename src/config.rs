//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (THINGTALK_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [catalog]
//! url = "https://thingpedia.stanford.edu/thingpedia"
//!
//! [cache]
//! class_ttl_secs = 3600
//! negative_ttl_ms = 600000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! THINGTALK_CATALOG__URL=https://almond.example.com/thingpedia
//! THINGTALK_CACHE__CLASS_TTL_SECS=60
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::schema::RetrieverOptions;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the metadata catalog lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the catalog API
    pub url: String,

    /// Developer key appended to catalog requests, if any
    #[serde(default)]
    pub developer_key: Option<String>,

    /// Locale for natural-language metadata
    #[serde(default = "default_locale")]
    pub locale: String,
}

/// Schema retriever cache behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long fetched classes stay cached, in seconds
    #[serde(default = "default_class_ttl_secs")]
    pub class_ttl_secs: u64,

    /// How long "class does not exist" stays cached, in milliseconds
    #[serde(default = "default_negative_ttl_ms")]
    pub negative_ttl_ms: u64,
}

/// Optimizer bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Maximum number of peephole passes per rule
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_class_ttl_secs() -> u64 {
    3600
}

fn default_negative_ttl_ms() -> u64 {
    600_000
}

fn default_max_iterations() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            url: "https://thingpedia.stanford.edu/thingpedia".to_string(),
            developer_key: None,
            locale: default_locale(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            class_ttl_secs: default_class_ttl_secs(),
            negative_ttl_ms: default_negative_ttl_ms(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig { max_iterations: default_max_iterations() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: default_log_level() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            catalog: CatalogConfig::default(),
            cache: CacheConfig::default(),
            optimizer: OptimizerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("THINGTALK_").split("__"))
            .extract()
    }
}

impl LoggingConfig {
    /// Install a global tracing subscriber honoring the configured level
    /// (RUST_LOG still wins when set). Safe to call more than once; later
    /// calls are ignored.
    pub fn init(&self) {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(self.level.clone()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }
}

impl CacheConfig {
    /// The retriever-facing view of the cache settings.
    pub fn retriever_options(&self) -> RetrieverOptions {
        RetrieverOptions {
            cache_ttl: Duration::from_secs(self.class_ttl_secs),
            negative_ttl: Duration::from_millis(self.negative_ttl_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.negative_ttl_ms, 600_000);
        assert_eq!(config.optimizer.max_iterations, 10);
        assert_eq!(config.catalog.locale, "en-US");
    }

    #[test]
    fn test_retriever_options() {
        let options = CacheConfig::default().retriever_options();
        assert_eq!(options.negative_ttl, Duration::from_millis(600_000));
        assert_eq!(options.cache_ttl, Duration::from_secs(3600));
    }
}
