//! # Tile Source Caching Layer
//!
//! Two caches sit between callers and their tile sources:
//!
//! - **Instance cache**: configured source instances keyed by the fingerprint
//!   of their locator, bounded by count. Evicted instances are shut down only
//!   after a grace delay and are re-adopted if requested again before then.
//! - **Result cache**: fetch results keyed by operation, source identity,
//!   request context and arguments, bounded by bytes and expired by TTL.
//!
//! Both deduplicate concurrent misses through [`SingleFlight`], so a burst of
//! identical requests reaches the underlying source once.
//!
//! ## Architecture
//!
//! ```text
//! TileCache::open(locator)
//!   └─► InstanceCache::get_or_open ──► SourceOpener::open
//!                                         └─► decorate ──► CachedSource
//! CachedSource::fetch_*(ctx, args)
//!   └─► KeyBuilder ──► ResultCache::get_or_compute ──► inner source
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tile_cache::cache::{CacheConfig, ResultCache};
//! use tile_cache::cache::types::Fingerprint;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CacheConfig::builder()
//!     .result_cache_size_mb(10)
//!     .result_ttl(Duration::from_secs(3600))
//!     .build();
//!
//! let cache: ResultCache<String> = ResultCache::new(config);
//! let key = Fingerprint::digest("fetch_tile:0/0/0");
//!
//! let value = cache
//!     .get_or_compute(key, |v: &String| v.len(), || async { Ok("tile".to_string()) })
//!     .await?;
//! assert_eq!(value, "tile");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod decorator;
pub mod entry;
pub mod facade;
pub mod instances;
pub mod key;
pub mod single_flight;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use decorator::{decorate, CachedSource, CachedValue};
pub use entry::{CacheEntry, CacheMetadata};
pub use facade::{SourceOpener, TileCache, TileCacheStats};
pub use instances::{InstanceCache, InstanceInfo, InstanceState, InstanceStats};
pub use key::KeyBuilder;
pub use single_flight::{FlightStats, SingleFlight};
pub use store::{start_auto_cleanup, ResultCache};
pub use types::{CacheStats, Fingerprint};
