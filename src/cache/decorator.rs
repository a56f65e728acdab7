//! Result caching attached to a source from the outside
//!
//! [`decorate`] wraps a source in a [`CachedSource`] that routes every
//! provided fetch through the shared [`ResultCache`]. `shutdown` passes
//! straight through; instance lifetime belongs to the instance cache.

use crate::cache::{key::KeyBuilder, store::ResultCache, types::Fingerprint};
use crate::error::{CacheError, Result};
use crate::source::{
    Grid, Metadata, Operation, RequestContext, SharedSource, Tile, TileCoord, TileSource,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Any fetch result, as stored in the shared result cache
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Tile(Tile),
    Grid(Grid),
    Metadata(Metadata),
}

impl CachedValue {
    /// Weight charged against the byte budget, never less than 1
    pub fn weight(&self) -> usize {
        let bytes = match self {
            CachedValue::Tile(tile) => tile_weight(tile),
            CachedValue::Grid(grid) => json_weight(&grid.data),
            CachedValue::Metadata(metadata) => json_weight(metadata.value()),
        };
        bytes.max(1)
    }
}

fn tile_weight(tile: &Tile) -> usize {
    tile.data.len()
}

fn json_weight(value: &serde_json::Value) -> usize {
    // serialization of a Value cannot fail
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(1)
}

/// A source whose fetches are coalesced and cached
pub struct CachedSource {
    inner: SharedSource,
    identity: Fingerprint,
    results: Arc<ResultCache<CachedValue>>,
}

impl CachedSource {
    /// The undecorated source
    pub fn inner(&self) -> &SharedSource {
        &self.inner
    }

    pub fn identity(&self) -> Fingerprint {
        self.identity
    }

    fn key(&self, op: Operation, ctx: &RequestContext) -> KeyBuilder {
        KeyBuilder::new(op.as_str())
            .identity(self.identity)
            .context(ctx)
    }
}

/// Attach result caching to `source`
///
/// Returns `source` itself when it is already cached.
pub fn decorate(
    identity: Fingerprint,
    source: SharedSource,
    results: Arc<ResultCache<CachedValue>>,
) -> SharedSource {
    if source.is_cached() {
        return source;
    }

    Arc::new(CachedSource {
        inner: source,
        identity,
        results,
    })
}

fn unexpected(op: Operation) -> CacheError {
    CacheError::Other(format!("cached value has the wrong shape for {}", op))
}

#[async_trait]
impl TileSource for CachedSource {
    fn supports(&self, op: Operation) -> bool {
        self.inner.supports(op)
    }

    async fn fetch_tile(&self, ctx: &RequestContext, coord: TileCoord) -> Result<Tile> {
        let op = Operation::FetchTile;
        if !self.inner.supports(op) {
            return self.inner.fetch_tile(ctx, coord).await;
        }

        let key = self.key(op, ctx).arg(coord.z).arg(coord.x).arg(coord.y).build();
        let value = self
            .results
            .get_or_compute(key, CachedValue::weight, || async move {
                self.inner.fetch_tile(ctx, coord).await.map(CachedValue::Tile)
            })
            .await?;

        match value {
            CachedValue::Tile(tile) => Ok(tile),
            _ => Err(unexpected(op)),
        }
    }

    async fn fetch_grid(&self, ctx: &RequestContext, coord: TileCoord) -> Result<Grid> {
        let op = Operation::FetchGrid;
        if !self.inner.supports(op) {
            return self.inner.fetch_grid(ctx, coord).await;
        }

        let key = self.key(op, ctx).arg(coord.z).arg(coord.x).arg(coord.y).build();
        let value = self
            .results
            .get_or_compute(key, CachedValue::weight, || async move {
                self.inner.fetch_grid(ctx, coord).await.map(CachedValue::Grid)
            })
            .await?;

        match value {
            CachedValue::Grid(grid) => Ok(grid),
            _ => Err(unexpected(op)),
        }
    }

    async fn fetch_metadata(&self, ctx: &RequestContext) -> Result<Metadata> {
        let op = Operation::FetchMetadata;
        if !self.inner.supports(op) {
            return self.inner.fetch_metadata(ctx).await;
        }

        let key = self.key(op, ctx).build();
        let value = self
            .results
            .get_or_compute(key, CachedValue::weight, || async move {
                self.inner.fetch_metadata(ctx).await.map(CachedValue::Metadata)
            })
            .await?;

        match value {
            CachedValue::Metadata(metadata) => Ok(metadata),
            _ => Err(unexpected(op)),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }

    fn is_cached(&self) -> bool {
        true
    }
}
