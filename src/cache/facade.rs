//! Entry point tying the instance cache and the result cache together

use crate::cache::{
    config::CacheConfig,
    decorator::{decorate, CachedValue},
    instances::{InstanceCache, InstanceStats},
    single_flight::FlightStats,
    store::{start_auto_cleanup, ResultCache},
    types::CacheStats,
};
use crate::error::{CacheError, Result};
use crate::locator::{Locator, LocatorInput};
use crate::source::SharedSource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Constructs a source for a locator
///
/// Any `Fn(Locator) -> impl Future<Output = Result<SharedSource>>` is an
/// opener, so plain async closures can be handed to [`TileCache::new`].
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, locator: Locator) -> Result<SharedSource>;
}

#[async_trait]
impl<F, Fut> SourceOpener for F
where
    F: Fn(Locator) -> Fut + Send + Sync,
    Fut: Future<Output = Result<SharedSource>> + Send + 'static,
{
    async fn open(&self, locator: Locator) -> Result<SharedSource> {
        (self)(locator).await
    }
}

/// Aggregated statistics across both caches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileCacheStats {
    pub results: CacheStats,
    pub instances: InstanceStats,
    pub result_flights: FlightStats,
    pub open_flights: FlightStats,
}

/// Long-lived caching service for tile sources
///
/// Construct one per process and share it by reference. `open` hands out
/// source instances that are reused across callers and, unless the locator
/// carries `cache=false`, answer fetches from a shared result cache.
pub struct TileCache {
    config: CacheConfig,

    results: Arc<ResultCache<CachedValue>>,

    instances: InstanceCache,

    opener: Arc<dyn SourceOpener>,

    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl TileCache {
    /// Create the service after validating `config`
    ///
    /// The auto-cleanup task is only started when called inside a tokio
    /// runtime.
    pub fn new(config: CacheConfig, opener: impl SourceOpener + 'static) -> Result<Self> {
        config.validate()?;

        let results = Arc::new(ResultCache::new(config.clone()));
        let instances = InstanceCache::new(config.clone());

        let cleanup = if config.enable_auto_cleanup && config.result_caching_enabled() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => Some(handle.spawn(start_auto_cleanup(
                    results.clone(),
                    config.cleanup_interval,
                ))),
                Err(_) => {
                    warn!("No tokio runtime available, result auto cleanup disabled");
                    None
                }
            }
        } else {
            None
        };

        info!(
            result_cache_bytes = config.result_cache_bytes,
            max_open_instances = config.max_open_instances,
            "Tile cache ready"
        );

        Ok(Self {
            config,
            results,
            instances,
            opener: Arc::new(opener),
            cleanup: Mutex::new(cleanup),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The shared result cache, for maintenance such as `clear`
    pub fn results(&self) -> &Arc<ResultCache<CachedValue>> {
        &self.results
    }

    pub fn instances(&self) -> &InstanceCache {
        &self.instances
    }

    /// Open (or reuse) the source named by `input`
    ///
    /// A structured locator is cloned before use and never modified. A
    /// malformed `cache` flag is logged and treated as enabled. Errors from
    /// the opener are reported as [`CacheError::OpenError`].
    pub async fn open(&self, input: impl Into<LocatorInput>) -> Result<SharedSource> {
        let locator = input.into().into_locator()?;

        let use_results = match locator.cache_flag() {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(
                    locator = %locator,
                    error = %e,
                    "Malformed cache flag, result caching stays enabled"
                );
                true
            }
        };
        let decorated = use_results && self.config.result_caching_enabled();

        let identity = locator.fingerprint()?;
        let opener = self.opener.clone();
        let results = self.results.clone();

        self.instances
            .get_or_open(identity, || async move {
                info!(locator = %locator, key = ?identity, "Opening tile source");
                let source = opener.open(locator).await.map_err(|e| match e {
                    CacheError::OpenError(_) => e,
                    other => CacheError::OpenError(other.to_string()),
                })?;

                if decorated {
                    Ok(decorate(identity, source, results))
                } else {
                    Ok(source)
                }
            })
            .await
    }

    /// Stop background work and shut down every instance
    ///
    /// Pending deferred shutdowns run immediately. Later calls to `open`
    /// fail with [`CacheError::Closed`]. Returns the number of instances
    /// shut down.
    pub async fn close(&self) -> usize {
        if let Some(task) = self.cleanup.lock().await.take() {
            task.abort();
        }
        self.instances.close().await
    }

    pub async fn is_closed(&self) -> bool {
        self.instances.is_closed().await
    }

    pub async fn stats(&self) -> TileCacheStats {
        TileCacheStats {
            results: self.results.stats().await,
            instances: self.instances.stats().await,
            result_flights: self.results.flight_stats(),
            open_flights: self.instances.flight_stats(),
        }
    }
}

impl Drop for TileCache {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Operation, RequestContext, Tile, TileCoord, TileSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoSource {
        path: String,
    }

    #[async_trait]
    impl TileSource for EchoSource {
        fn supports(&self, op: Operation) -> bool {
            op == Operation::FetchTile
        }

        async fn fetch_tile(&self, _ctx: &RequestContext, coord: TileCoord) -> Result<Tile> {
            Ok(Tile::new(format!("{}:{}", self.path, coord).into_bytes()))
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    struct CountingOpener {
        opens: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceOpener for CountingOpener {
        async fn open(&self, locator: Locator) -> Result<SharedSource> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if locator.path.contains("missing") {
                return Err(CacheError::Other(format!("no such source {}", locator.path)));
            }
            let source: SharedSource = Arc::new(EchoSource { path: locator.path });
            Ok(source)
        }
    }

    fn counting_opener(opens: Arc<AtomicUsize>) -> CountingOpener {
        CountingOpener { opens }
    }

    #[tokio::test]
    async fn test_closure_opener() {
        let cache = TileCache::new(CacheConfig::default(), |locator: Locator| async move {
            let source: SharedSource = Arc::new(EchoSource { path: locator.path });
            Ok(source)
        })
        .unwrap();

        let source = cache.open("file:///tiles").await.unwrap();
        let tile = source
            .fetch_tile(&RequestContext::new(), TileCoord::new(3, 2, 1))
            .await
            .unwrap();
        assert_eq!(tile.data.as_slice(), b"/tiles:3/2/1");
    }

    #[tokio::test]
    async fn test_open_decorates_by_default() {
        let opens = Arc::new(AtomicUsize::new(0));
        let cache = TileCache::new(CacheConfig::default(), counting_opener(opens.clone())).unwrap();

        let source = cache.open("mbtiles:///data/world.mbtiles").await.unwrap();
        assert!(source.is_cached());

        let again = cache.open("mbtiles:///data/world.mbtiles").await.unwrap();
        assert!(Arc::ptr_eq(&source, &again));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheme_case_does_not_split_instances() {
        let opens = Arc::new(AtomicUsize::new(0));
        let cache = TileCache::new(CacheConfig::default(), counting_opener(opens.clone())).unwrap();

        let structured = Locator::new("MBTiles", "/x");
        let from_string = cache.open("MBTiles:///x").await.unwrap();
        let from_struct = cache.open(&structured).await.unwrap();

        assert!(Arc::ptr_eq(&from_string, &from_struct));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(structured.scheme, "MBTiles");
    }

    #[tokio::test]
    async fn test_cache_flag_controls_decoration() {
        let opens = Arc::new(AtomicUsize::new(0));
        let cache = TileCache::new(CacheConfig::default(), counting_opener(opens.clone())).unwrap();

        let raw = cache.open("mbtiles:///a.mbtiles?cache=false").await.unwrap();
        assert!(!raw.is_cached());

        let malformed = cache.open("mbtiles:///a.mbtiles?cache=maybe").await.unwrap();
        assert!(malformed.is_cached());

        let null = cache.open("mbtiles:///a.mbtiles?cache=null").await.unwrap();
        assert!(!null.is_cached());
    }

    #[tokio::test]
    async fn test_zero_budget_skips_decoration() {
        let opens = Arc::new(AtomicUsize::new(0));
        let config = CacheConfig::builder().result_cache_bytes(0).build();
        let cache = TileCache::new(config, counting_opener(opens)).unwrap();

        let source = cache.open("mbtiles:///a.mbtiles").await.unwrap();
        assert!(!source.is_cached());
    }

    #[tokio::test]
    async fn test_open_failure_is_reported_and_retryable() {
        let opens = Arc::new(AtomicUsize::new(0));
        let cache = TileCache::new(CacheConfig::default(), counting_opener(opens.clone())).unwrap();

        for _ in 0..2 {
            let result = cache.open("mbtiles:///missing.mbtiles").await;
            assert!(matches!(result, Err(CacheError::OpenError(_))));
        }
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert!(cache.instances().is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_locator_and_config_are_rejected() {
        let opens = Arc::new(AtomicUsize::new(0));
        let cache = TileCache::new(CacheConfig::default(), counting_opener(opens.clone())).unwrap();
        assert!(matches!(cache.open("").await, Err(CacheError::LocatorError(_))));
        assert_eq!(opens.load(Ordering::SeqCst), 0);

        let bad = CacheConfig::builder().max_open_instances(0).build();
        assert!(matches!(
            TileCache::new(bad, counting_opener(opens)),
            Err(CacheError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_later_opens() {
        let opens = Arc::new(AtomicUsize::new(0));
        let config = CacheConfig::builder()
            .enable_auto_cleanup(true)
            .cleanup_interval(Duration::from_secs(60))
            .build();
        let cache = TileCache::new(config, counting_opener(opens)).unwrap();

        cache.open("mbtiles:///a.mbtiles").await.unwrap();
        cache.open("mbtiles:///b.mbtiles").await.unwrap();

        assert_eq!(cache.close().await, 2);
        assert!(cache.is_closed().await);
        assert!(matches!(
            cache.open("mbtiles:///a.mbtiles").await,
            Err(CacheError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_stats_aggregate_both_caches() {
        let opens = Arc::new(AtomicUsize::new(0));
        let cache = TileCache::new(CacheConfig::default(), counting_opener(opens)).unwrap();
        let ctx = RequestContext::new();

        let source = cache.open("mbtiles:///a.mbtiles").await.unwrap();
        source.fetch_tile(&ctx, TileCoord::new(0, 0, 0)).await.unwrap();
        source.fetch_tile(&ctx, TileCoord::new(0, 0, 0)).await.unwrap();
        cache.open("mbtiles:///a.mbtiles").await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.results.hits, 1);
        assert_eq!(stats.results.misses, 1);
        assert_eq!(stats.instances.opens, 1);
        assert_eq!(stats.instances.reuses, 1);
        assert_eq!(stats.open_flights.leader_requests, 1);
    }
}
