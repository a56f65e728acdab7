//! Byte-bounded result cache with TTL expiry and LRU eviction

use crate::cache::{
    config::CacheConfig,
    entry::CacheEntry,
    single_flight::{FlightStats, SingleFlight},
    types::{CacheStats, Fingerprint},
};
use crate::error::Result;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Cache of fetch results keyed by fingerprint
///
/// - Total stored weight stays within `result_cache_bytes`; the least recently
///   read entries go first when it would not.
/// - Entries older than their TTL are treated as absent when read.
/// - Concurrent misses for the same fingerprint run `compute` once.
/// - A zero byte budget stores nothing but still coalesces.
pub struct ResultCache<V> {
    pub(crate) config: CacheConfig,

    store: RwLock<ResultStore<V>>,

    flights: SingleFlight<Fingerprint, V>,
}

struct ResultStore<V> {
    entries: HashMap<Fingerprint, CacheEntry<V>>,

    /// recency tick -> fingerprint, oldest first
    lru_index: BTreeMap<u64, Fingerprint>,

    next_recency: u64,

    stats: CacheStats,

    current_size_bytes: usize,
}

impl<V> ResultStore<V> {
    fn touch(&mut self, fingerprint: &Fingerprint) {
        let recency = self.next_recency;
        self.next_recency += 1;
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            self.lru_index.remove(&entry.metadata.recency);
            entry.mark_accessed(recency);
            self.lru_index.insert(recency, *fingerprint);
        }
    }

    fn remove_entry(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(fingerprint)?;
        self.lru_index.remove(&entry.metadata.recency);
        self.current_size_bytes = self
            .current_size_bytes
            .saturating_sub(entry.metadata.size_bytes);
        self.stats.entries = self.entries.len();
        self.stats.size_bytes = self.current_size_bytes;
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<Fingerprint> {
        let (_, fingerprint) = self.lru_index.pop_first()?;
        if let Some(entry) = self.entries.remove(&fingerprint) {
            self.current_size_bytes = self
                .current_size_bytes
                .saturating_sub(entry.metadata.size_bytes);
        }
        self.stats.evictions_size += 1;
        self.stats.entries = self.entries.len();
        self.stats.size_bytes = self.current_size_bytes;
        Some(fingerprint)
    }
}

impl<V> ResultCache<V>
where
    V: Clone,
{
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!(
            capacity_bytes = config.result_cache_bytes,
            ttl_secs = config.result_ttl.as_secs(),
            "Initializing result cache"
        );

        let store = ResultStore {
            entries: HashMap::new(),
            lru_index: BTreeMap::new(),
            // 0 marks an entry not yet placed in the index
            next_recency: 1,
            stats: CacheStats::default(),
            current_size_bytes: 0,
        };

        Self {
            config,
            store: RwLock::new(store),
            flights: SingleFlight::new(),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.config.result_cache_bytes
    }

    /// Return the cached value for `fingerprint`, computing it on a miss
    ///
    /// `size_of` weighs a freshly computed value against the byte budget.
    /// Failed computations are never stored.
    pub async fn get_or_compute<S, F, Fut>(
        &self,
        fingerprint: Fingerprint,
        size_of: S,
        compute: F,
    ) -> Result<V>
    where
        S: FnOnce(&V) -> usize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if self.capacity_bytes() == 0 {
            return self.flights.run(fingerprint, compute).await;
        }

        if let Some(value) = self.get(&fingerprint).await {
            return Ok(value);
        }

        self.flights
            .run(fingerprint, || async move {
                // a producer that finished between our miss and this flight
                // has already stored the value
                if let Some(value) = self.peek(&fingerprint).await {
                    return Ok(value);
                }
                let value = compute().await?;
                let size = size_of(&value);
                self.insert(fingerprint, value.clone(), size).await;
                Ok(value)
            })
            .await
    }

    /// Get a live value, refreshing its recency
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<V> {
        let mut store = self.store.write().await;

        let expired = match store.entries.get(fingerprint) {
            Some(entry) => entry.is_expired(),
            None => {
                debug!(key = ?fingerprint, "Cache miss");
                store.stats.misses += 1;
                return None;
            }
        };

        if expired {
            debug!(key = ?fingerprint, "Cache entry expired");
            store.remove_entry(fingerprint);
            store.stats.misses += 1;
            store.stats.evictions_ttl += 1;
            return None;
        }

        store.touch(fingerprint);
        store.stats.hits += 1;
        debug!(key = ?fingerprint, "Cache hit");
        store.entries.get(fingerprint).map(|entry| entry.value.clone())
    }

    /// Get a live value without touching recency or statistics
    async fn peek(&self, fingerprint: &Fingerprint) -> Option<V> {
        let store = self.store.read().await;
        store
            .entries
            .get(fingerprint)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Store a value, evicting least recently used entries to fit it
    ///
    /// A value heavier than the whole budget is not retained; it is counted as
    /// a size eviction and the existing entries are left alone.
    pub async fn insert(&self, fingerprint: Fingerprint, value: V, size_bytes: usize) {
        let capacity = self.capacity_bytes();
        let mut store = self.store.write().await;

        store.remove_entry(&fingerprint);

        if size_bytes > capacity {
            debug!(
                key = ?fingerprint,
                size_bytes,
                capacity,
                "Result larger than cache budget, not retained"
            );
            store.stats.evictions_size += 1;
            return;
        }

        while store.current_size_bytes + size_bytes > capacity {
            match store.evict_lru() {
                Some(evicted) => debug!(key = ?evicted, "Evicting entry due to size limit"),
                None => break,
            }
        }

        let ttl = self.config.ttl_with_jitter();
        let entry = CacheEntry::new(fingerprint, value, size_bytes, ttl);
        store.entries.insert(fingerprint, entry);
        store.touch(&fingerprint);
        store.current_size_bytes += size_bytes;
        store.stats.entries = store.entries.len();
        store.stats.size_bytes = store.current_size_bytes;
        debug!(key = ?fingerprint, size_bytes, "Stored result");
    }

    /// Check if a live entry exists (without updating recency)
    pub async fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.peek(fingerprint).await.is_some()
    }

    /// Remove a specific entry from the cache
    pub async fn remove(&self, fingerprint: &Fingerprint) -> Option<V> {
        let mut store = self.store.write().await;
        let entry = store.remove_entry(fingerprint)?;
        store.stats.invalidations += 1;
        debug!(key = ?fingerprint, "Removed cache entry");
        Some(entry.value)
    }

    /// Clear all entries from the cache
    pub async fn clear(&self) {
        let mut store = self.store.write().await;

        let count = store.entries.len();
        store.entries.clear();
        store.lru_index.clear();
        store.current_size_bytes = 0;
        store.stats.entries = 0;
        store.stats.size_bytes = 0;
        store.stats.invalidations += count as u64;

        info!("Cleared {} entries from result cache", count);
    }

    /// Remove all expired entries, returning how many were dropped
    pub async fn cleanup_expired(&self) -> usize {
        let mut store = self.store.write().await;

        let expired: Vec<Fingerprint> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(fingerprint, _)| *fingerprint)
            .collect();

        for fingerprint in &expired {
            store.remove_entry(fingerprint);
        }
        store.stats.evictions_ttl += expired.len() as u64;

        if !expired.is_empty() {
            debug!("Cleaned up {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        self.store.read().await.stats.clone()
    }

    /// Coalescing statistics for cache misses
    pub fn flight_stats(&self) -> FlightStats {
        self.flights.stats()
    }

    /// Get current cache size in bytes
    pub async fn size_bytes(&self) -> usize {
        self.store.read().await.current_size_bytes
    }

    /// Get number of entries in cache
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    /// Check if cache is empty
    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }
}

/// Background task that prunes expired results every `interval`
pub async fn start_auto_cleanup<V>(cache: Arc<ResultCache<V>>, interval: Duration)
where
    V: Clone + Send + Sync + 'static,
{
    info!("Starting automatic cache cleanup task (interval: {:?})", interval);

    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let removed = cache.cleanup_expired().await;
        if removed > 0 {
            debug!("Auto cleanup removed {} expired entries", removed);
        }
        let stats = cache.stats().await;
        if stats.size_bytes > cache.capacity_bytes() {
            warn!(
                size_bytes = stats.size_bytes,
                capacity = cache.capacity_bytes(),
                "Result cache is over its byte budget"
            );
        }
    }
}
