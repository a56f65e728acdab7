//! # Tile Cache (tile-cache)
//!
//! A caching layer for tile sources: reuses configured source instances and
//! serves repeated tile, grid and metadata fetches from memory.
//!
//! ## Features
//!
//! - Instance reuse keyed by locator, with a count bound and deferred shutdown
//! - Byte-bounded LRU result cache with TTL expiry
//! - Single-flight coalescing of concurrent identical opens and fetches
//! - Per-request context folded into result keys
//! - `cache=false` locator flag to opt a source out of result caching
//!
//! ## Opening Sources
//!
//! Any async closure from [`Locator`] to [`SharedSource`] can open sources.
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tile_cache::{
//!     CacheConfig, Locator, RequestContext, Result, SharedSource, Tile, TileCache, TileCoord,
//!     TileSource,
//! };
//!
//! struct Blank;
//!
//! #[async_trait]
//! impl TileSource for Blank {
//!     fn supports(&self, _op: tile_cache::Operation) -> bool {
//!         true
//!     }
//!
//!     async fn fetch_tile(&self, _ctx: &RequestContext, _coord: TileCoord) -> Result<Tile> {
//!         Ok(Tile::new(vec![0u8; 256]))
//!     }
//!
//!     async fn shutdown(&self) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = TileCache::new(CacheConfig::from_env()?, |_locator: Locator| async {
//!         let source: SharedSource = Arc::new(Blank);
//!         Ok(source)
//!     })?;
//!
//!     let source = cache.open("blank:///world?cache=true").await?;
//!     let ctx = RequestContext::new().with("scope", "public");
//!     let tile = source.fetch_tile(&ctx, TileCoord::new(0, 0, 0)).await?;
//!     println!("tile is {} bytes", tile.len());
//!
//!     println!("{:?}", cache.stats().await);
//!     cache.close().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod locator;
pub mod source;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheStats, CachedSource, CachedValue, Fingerprint,
    FlightStats, InstanceCache, InstanceInfo, InstanceState, InstanceStats, KeyBuilder,
    ResultCache, SingleFlight, SourceOpener, TileCache, TileCacheStats,
};
pub use error::{CacheError, Result};
pub use locator::{Locator, LocatorInput, CACHE_FLAG};
pub use source::{
    Grid, Headers, Metadata, Operation, RequestContext, SharedSource, Tile, TileCoord, TileSource,
};
