//! Tile source capability surface
//!
//! A source produces tiles, UTF grids and metadata for one configuration.
//! Sources are shared as [`SharedSource`] handles; the cache layer wraps them
//! without their cooperation.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a live source
pub type SharedSource = Arc<dyn TileSource>;

/// Response headers attached to tiles and grids
pub type Headers = BTreeMap<String, String>;

/// Fetch operations a source may provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    FetchTile,
    FetchGrid,
    FetchMetadata,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::FetchTile => "fetch_tile",
            Operation::FetchGrid => "fetch_grid",
            Operation::FetchMetadata => "fetch_metadata",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Zoom/column/row address of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Encoded tile payload, cheap to clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub data: Arc<Vec<u8>>,
    pub headers: Headers,
}

impl Tile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// UTF grid for a tile
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub data: Arc<Value>,
    pub headers: Headers,
}

impl Grid {
    pub fn new(data: Value) -> Self {
        Self {
            data: Arc::new(data),
            headers: Headers::new(),
        }
    }
}

/// Source description (bounds, zoom range, attribution, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata(pub Arc<Value>);

impl Metadata {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// Properties a caller attaches to a request
///
/// Folded into result fingerprints, so two requests with identical
/// coordinates but different properties (e.g. auth scope) never share a
/// cached result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestContext {
    properties: BTreeMap<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// A pluggable producer of tiles, grids and metadata
///
/// Any subset of the fetch operations may be provided; [`TileSource::supports`]
/// reports which. Unprovided operations fail with [`CacheError::Unsupported`].
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Whether this source provides `op`
    fn supports(&self, op: Operation) -> bool;

    async fn fetch_tile(&self, _ctx: &RequestContext, _coord: TileCoord) -> Result<Tile> {
        Err(CacheError::Unsupported(Operation::FetchTile.to_string()))
    }

    async fn fetch_grid(&self, _ctx: &RequestContext, _coord: TileCoord) -> Result<Grid> {
        Err(CacheError::Unsupported(Operation::FetchGrid.to_string()))
    }

    async fn fetch_metadata(&self, _ctx: &RequestContext) -> Result<Metadata> {
        Err(CacheError::Unsupported(Operation::FetchMetadata.to_string()))
    }

    /// Release resources held by the source
    async fn shutdown(&self) -> Result<()>;

    /// Whether result caching has already been attached to this source
    fn is_cached(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct MetadataOnly;

    #[async_trait]
    impl TileSource for MetadataOnly {
        fn supports(&self, op: Operation) -> bool {
            op == Operation::FetchMetadata
        }

        async fn fetch_metadata(&self, _ctx: &RequestContext) -> Result<Metadata> {
            Ok(Metadata::new(json!({ "name": "basemap" })))
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unprovided_operations_are_unsupported() {
        let source: SharedSource = Arc::new(MetadataOnly);
        let ctx = RequestContext::new();

        assert!(source.supports(Operation::FetchMetadata));
        assert!(!source.supports(Operation::FetchTile));
        assert!(!source.is_cached());

        let err = source
            .fetch_tile(&ctx, TileCoord::new(0, 0, 0))
            .await
            .unwrap_err();
        assert_eq!(err, CacheError::Unsupported("fetch_tile".to_string()));

        let metadata = source.fetch_metadata(&ctx).await.unwrap();
        assert_eq!(metadata.value()["name"], "basemap");
    }

    #[test]
    fn test_request_context_properties_are_ordered() {
        let ctx = RequestContext::new().with("scope", "private").with("account", 42);
        let keys: Vec<&String> = ctx.properties().keys().collect();
        assert_eq!(keys, vec!["account", "scope"]);
        assert_eq!(ctx.get("account"), Some(&json!(42)));
    }

    #[test]
    fn test_tile_coord_display() {
        assert_eq!(TileCoord::new(3, 4, 5).to_string(), "3/4/5");
        assert_eq!(Operation::FetchGrid.to_string(), "fetch_grid");
    }
}
