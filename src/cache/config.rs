//! Configuration for the tile cache

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const MB: usize = 1024 * 1024;

/// Configuration for the result cache, the instance cache and the facade
///
/// Defaults:
/// - 10 MB of cached results, expiring after 6 hours
/// - 6 open source instances, shut down 30 seconds after eviction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for cached fetch results. Zero disables result caching
    /// but keeps request coalescing.
    pub result_cache_bytes: usize,

    /// Maximum number of live source instances
    pub max_open_instances: usize,

    /// Grace period between evicting an instance and shutting it down
    pub instance_close_delay: Duration,

    /// Time-to-live for cached results
    pub result_ttl: Duration,

    /// TTL jitter factor (0.0 - 1.0)
    /// Spreads expiry of entries populated together
    pub ttl_jitter: f64,

    /// Run a background task that prunes expired results
    pub enable_auto_cleanup: bool,

    /// Interval for automatic cleanup checks
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            result_cache_bytes: 10 * MB,
            max_open_instances: 6,
            instance_close_delay: Duration::from_secs(30),
            result_ttl: Duration::from_secs(6 * 3600),
            ttl_jitter: 0.0,
            enable_auto_cleanup: false,
            // Cleanup every 5 minutes
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Load configuration from the environment, reading a `.env` file first if present
    ///
    /// Recognized variables: `TILE_CACHE_SIZE_MB`, `TILE_CACHE_MAX_SOURCES`,
    /// `TILE_CACHE_CLOSE_DELAY_SECS`, `TILE_CACHE_TTL_HOURS`, `TILE_CACHE_TTL_JITTER`.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from any variable source, such as a map in tests
    ///
    /// Takes the same variables as [`CacheConfig::from_env`].
    pub fn from_lookup<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(mb) = parse_setting::<usize>(&lookup, "TILE_CACHE_SIZE_MB")? {
            builder = builder.result_cache_size_mb(mb);
        }
        if let Some(max) = parse_setting::<usize>(&lookup, "TILE_CACHE_MAX_SOURCES")? {
            builder = builder.max_open_instances(max);
        }
        if let Some(secs) = parse_setting::<u64>(&lookup, "TILE_CACHE_CLOSE_DELAY_SECS")? {
            builder = builder.instance_close_delay(Duration::from_secs(secs));
        }
        if let Some(hours) = parse_setting::<f64>(&lookup, "TILE_CACHE_TTL_HOURS")? {
            if !hours.is_finite() || hours < 0.0 {
                return Err(CacheError::ConfigError(format!(
                    "TILE_CACHE_TTL_HOURS must be a non-negative number, got {}",
                    hours
                )));
            }
            builder = builder.result_ttl(Duration::from_secs_f64(hours * 3600.0));
        }
        if let Some(jitter) = parse_setting::<f64>(&lookup, "TILE_CACHE_TTL_JITTER")? {
            builder = builder.ttl_jitter(jitter);
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_open_instances == 0 {
            return Err(CacheError::ConfigError(
                "max_open_instances must be greater than 0".to_string(),
            ));
        }

        if self.result_ttl.is_zero() {
            return Err(CacheError::ConfigError(
                "result_ttl must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "cleanup_interval must be greater than 0 when auto cleanup is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether fetch results are cached at all
    pub fn result_caching_enabled(&self) -> bool {
        self.result_cache_bytes > 0
    }

    /// Calculate actual TTL with jitter applied
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.result_ttl;
        }

        let base_secs = self.result_ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.001);

        Duration::from_secs_f64(final_secs)
    }
}

fn parse_setting<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            warn!(variable = name, value = %raw, "Rejecting unparseable cache setting");
            CacheError::ConfigError(format!("{} has an invalid value: {:?}", name, raw))
        }),
        None => Ok(None),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    result_cache_bytes: Option<usize>,
    max_open_instances: Option<usize>,
    instance_close_delay: Option<Duration>,
    result_ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set the result cache budget in megabytes (0 disables result caching)
    pub fn result_cache_size_mb(mut self, mb: usize) -> Self {
        self.result_cache_bytes = Some(mb.saturating_mul(MB));
        self
    }

    /// Set the result cache budget in bytes
    pub fn result_cache_bytes(mut self, bytes: usize) -> Self {
        self.result_cache_bytes = Some(bytes);
        self
    }

    /// Set the maximum number of live source instances
    pub fn max_open_instances(mut self, max: usize) -> Self {
        self.max_open_instances = Some(max);
        self
    }

    /// Set the grace period before an evicted instance is shut down
    pub fn instance_close_delay(mut self, delay: Duration) -> Self {
        self.instance_close_delay = Some(delay);
        self
    }

    /// Set the time-to-live for cached results
    pub fn result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            result_cache_bytes: self.result_cache_bytes.unwrap_or(defaults.result_cache_bytes),
            max_open_instances: self.max_open_instances.unwrap_or(defaults.max_open_instances),
            instance_close_delay: self
                .instance_close_delay
                .unwrap_or(defaults.instance_close_delay),
            result_ttl: self.result_ttl.unwrap_or(defaults.result_ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}
