//! Count-bounded cache of live source instances
//!
//! Opening the same configuration twice yields the same instance. When more
//! than `max_open_instances` are live, the least recently requested one is
//! evicted, but its shutdown is deferred by `instance_close_delay` so handles
//! given out just before eviction keep working. Requesting an evicted
//! instance before the delay elapses cancels the shutdown and puts it back.

use crate::cache::{
    config::CacheConfig,
    single_flight::{FlightStats, SingleFlight},
    types::Fingerprint,
};
use crate::error::{CacheError, Result};
use crate::source::SharedSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters for instance cache monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    /// Instances currently held live
    pub live: usize,
    /// Evicted instances waiting for their deferred shutdown
    pub pending_shutdown: usize,
    /// Underlying opens performed
    pub opens: u64,
    /// Requests served by a live instance
    pub reuses: u64,
    /// Evicted instances re-adopted before shutdown
    pub resurrections: u64,
    /// Instances evicted to respect the count limit
    pub evictions: u64,
    /// Shutdowns that completed
    pub shutdowns: u64,
    /// Shutdowns that returned an error
    pub shutdown_failures: u64,
}

/// Lifecycle state reported by [`InstanceCache::snapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceState {
    Live,
    PendingShutdown { evicted_at: DateTime<Utc> },
}

/// Diagnostic view of one cached instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub opened_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: InstanceState,
}

#[derive(Clone)]
struct InstanceEntry {
    id: Uuid,
    fingerprint: Fingerprint,
    source: SharedSource,
    opened_at: DateTime<Utc>,
    recency: u64,
}

struct RetiringInstance {
    entry: InstanceEntry,
    evicted_at: DateTime<Utc>,
    timer: JoinHandle<()>,
}

struct InstanceStore {
    live: HashMap<Fingerprint, InstanceEntry>,

    /// recency tick -> fingerprint, oldest first
    lru_index: BTreeMap<u64, Fingerprint>,

    next_recency: u64,

    retiring: HashMap<Fingerprint, RetiringInstance>,

    stats: InstanceStats,

    closed: bool,
}

impl InstanceStore {
    fn touch(&mut self, fingerprint: &Fingerprint) {
        let recency = self.next_recency;
        self.next_recency += 1;
        if let Some(entry) = self.live.get_mut(fingerprint) {
            self.lru_index.remove(&entry.recency);
            entry.recency = recency;
            self.lru_index.insert(recency, *fingerprint);
        }
    }

    fn refresh_counts(&mut self) {
        self.stats.live = self.live.len();
        self.stats.pending_shutdown = self.retiring.len();
    }
}

/// Cache of live sources keyed by configuration fingerprint
pub struct InstanceCache {
    config: CacheConfig,

    store: Arc<Mutex<InstanceStore>>,

    flights: SingleFlight<Fingerprint, SharedSource>,
}

impl InstanceCache {
    /// Create a new instance cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!(
            max_open_instances = config.max_open_instances,
            close_delay_secs = config.instance_close_delay.as_secs(),
            "Initializing instance cache"
        );

        let store = InstanceStore {
            live: HashMap::new(),
            lru_index: BTreeMap::new(),
            next_recency: 1,
            retiring: HashMap::new(),
            stats: InstanceStats::default(),
            closed: false,
        };

        Self {
            config,
            store: Arc::new(Mutex::new(store)),
            flights: SingleFlight::new(),
        }
    }

    pub fn max_open_instances(&self) -> usize {
        self.config.max_open_instances
    }

    pub fn close_delay(&self) -> Duration {
        self.config.instance_close_delay
    }

    /// Return the instance for `fingerprint`, calling `open` only when none
    /// is live or pending shutdown
    ///
    /// Concurrent calls for the same fingerprint share one `open`. A failed
    /// open is reported to all of them and nothing is cached.
    pub async fn get_or_open<F, Fut>(&self, fingerprint: Fingerprint, open: F) -> Result<SharedSource>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedSource>>,
    {
        if let Some(source) = self.adopt(&fingerprint).await? {
            return Ok(source);
        }

        self.flights
            .run(fingerprint, || async move {
                if let Some(source) = self.adopt(&fingerprint).await? {
                    return Ok(source);
                }
                let source = open().await?;
                self.admit(fingerprint, source.clone()).await?;
                Ok(source)
            })
            .await
    }

    /// Hand out a live or retiring instance, cancelling any pending shutdown
    async fn adopt(&self, fingerprint: &Fingerprint) -> Result<Option<SharedSource>> {
        let mut store = self.store.lock().await;
        if store.closed {
            return Err(CacheError::Closed);
        }

        if store.live.contains_key(fingerprint) {
            store.touch(fingerprint);
            store.stats.reuses += 1;
            debug!(key = ?fingerprint, "Reusing live source instance");
            return Ok(store.live.get(fingerprint).map(|entry| entry.source.clone()));
        }

        let Some(retiring) = store.retiring.remove(fingerprint) else {
            return Ok(None);
        };
        retiring.timer.abort();

        info!(
            key = ?fingerprint,
            instance = %retiring.entry.id,
            "Re-adopting evicted source instance, shutdown cancelled"
        );
        let source = retiring.entry.source.clone();
        store.live.insert(*fingerprint, retiring.entry);
        store.touch(fingerprint);
        store.stats.resurrections += 1;
        self.enforce_capacity(&mut store);
        store.refresh_counts();

        Ok(Some(source))
    }

    /// Record a freshly opened instance
    async fn admit(&self, fingerprint: Fingerprint, source: SharedSource) -> Result<()> {
        let mut store = self.store.lock().await;
        if store.closed {
            drop(store);
            // opened while closing; nobody else will release it
            if let Err(e) = source.shutdown().await {
                warn!(key = ?fingerprint, error = %e, "Shutdown of late-opened source failed");
            }
            return Err(CacheError::Closed);
        }

        let entry = InstanceEntry {
            id: Uuid::new_v4(),
            fingerprint,
            source,
            opened_at: Utc::now(),
            recency: 0,
        };
        info!(key = ?fingerprint, instance = %entry.id, "Opened source instance");

        store.live.insert(fingerprint, entry);
        store.touch(&fingerprint);
        store.stats.opens += 1;
        self.enforce_capacity(&mut store);
        store.refresh_counts();
        Ok(())
    }

    /// Evict least recently used instances until within the count limit
    fn enforce_capacity(&self, store: &mut InstanceStore) {
        while store.live.len() > self.config.max_open_instances {
            let Some((_, fingerprint)) = store.lru_index.pop_first() else {
                break;
            };
            let Some(entry) = store.live.remove(&fingerprint) else {
                continue;
            };
            store.stats.evictions += 1;
            debug!(
                key = ?fingerprint,
                instance = %entry.id,
                delay_secs = self.config.instance_close_delay.as_secs(),
                "Evicting source instance, scheduling shutdown"
            );

            let timer = self.schedule_shutdown(fingerprint, entry.id);
            store.retiring.insert(
                fingerprint,
                RetiringInstance {
                    entry,
                    evicted_at: Utc::now(),
                    timer,
                },
            );
        }
    }

    fn schedule_shutdown(&self, fingerprint: Fingerprint, id: Uuid) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        // the grace period starts at eviction, not when the task first runs
        let deadline = Instant::now() + self.config.instance_close_delay;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;

            let retired = {
                let mut guard = store.lock().await;
                // re-adopted or replaced in the meantime
                if guard.retiring.get(&fingerprint).map(|r| r.entry.id) != Some(id) {
                    return;
                }
                let retired = guard.retiring.remove(&fingerprint);
                guard.refresh_counts();
                retired
            };

            if let Some(retired) = retired {
                shut_down(&store, retired.entry).await;
            }
        })
    }

    /// Shut down every evicted instance now instead of after its delay
    pub async fn flush_pending(&self) -> usize {
        let pending: Vec<RetiringInstance> = {
            let mut store = self.store.lock().await;
            let drained = store.retiring.drain().map(|(_, retiring)| retiring).collect();
            store.refresh_counts();
            drained
        };

        let count = pending.len();
        for retiring in pending {
            retiring.timer.abort();
            shut_down(&self.store, retiring.entry).await;
        }
        count
    }

    /// Shut down every instance, live or pending, and refuse further opens
    ///
    /// Returns the number of instances shut down.
    pub async fn close(&self) -> usize {
        let (live, pending) = {
            let mut store = self.store.lock().await;
            store.closed = true;
            store.lru_index.clear();
            let live: Vec<InstanceEntry> = store.live.drain().map(|(_, entry)| entry).collect();
            let pending: Vec<RetiringInstance> =
                store.retiring.drain().map(|(_, retiring)| retiring).collect();
            store.refresh_counts();
            (live, pending)
        };

        let mut count = 0;
        for retiring in pending {
            retiring.timer.abort();
            shut_down(&self.store, retiring.entry).await;
            count += 1;
        }
        for entry in live {
            shut_down(&self.store, entry).await;
            count += 1;
        }

        info!("Instance cache closed, {} instances shut down", count);
        count
    }

    pub async fn is_closed(&self) -> bool {
        self.store.lock().await.closed
    }

    /// Whether `fingerprint` is live (pending shutdown does not count)
    pub async fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.store.lock().await.live.contains_key(fingerprint)
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.lock().await.live.is_empty()
    }

    pub async fn stats(&self) -> InstanceStats {
        self.store.lock().await.stats.clone()
    }

    /// Coalescing statistics for opens
    pub fn flight_stats(&self) -> FlightStats {
        self.flights.stats()
    }

    /// List live and retiring instances, most recently used live ones first
    pub async fn snapshot(&self) -> Vec<InstanceInfo> {
        let store = self.store.lock().await;

        let mut live: Vec<&InstanceEntry> = store.live.values().collect();
        live.sort_by(|a, b| b.recency.cmp(&a.recency));

        let mut infos: Vec<InstanceInfo> = live
            .into_iter()
            .map(|entry| InstanceInfo {
                id: entry.id,
                fingerprint: entry.fingerprint,
                opened_at: entry.opened_at,
                state: InstanceState::Live,
            })
            .collect();

        infos.extend(store.retiring.values().map(|retiring| InstanceInfo {
            id: retiring.entry.id,
            fingerprint: retiring.entry.fingerprint,
            opened_at: retiring.entry.opened_at,
            state: InstanceState::PendingShutdown {
                evicted_at: retiring.evicted_at,
            },
        }));
        infos
    }
}

/// Best-effort shutdown; failures are logged and counted, never propagated
async fn shut_down(store: &Mutex<InstanceStore>, entry: InstanceEntry) {
    let fingerprint = entry.fingerprint;
    let outcome = entry.source.shutdown().await;

    let mut store = store.lock().await;
    match outcome {
        Ok(()) => {
            store.stats.shutdowns += 1;
            info!(key = ?fingerprint, instance = %entry.id, "Source instance shut down");
        }
        Err(e) => {
            store.stats.shutdown_failures += 1;
            warn!(
                key = ?fingerprint,
                instance = %entry.id,
                error = %e,
                "Source instance shutdown failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Operation, TileSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubSource {
        shutdowns: AtomicUsize,
        fail_shutdown: bool,
    }

    #[async_trait]
    impl TileSource for StubSource {
        fn supports(&self, _op: Operation) -> bool {
            false
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                Err(CacheError::ShutdownError("disk gone".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn cache(max: usize) -> InstanceCache {
        InstanceCache::new(
            CacheConfig::builder()
                .max_open_instances(max)
                .instance_close_delay(Duration::from_secs(30))
                .build(),
        )
    }

    fn key(name: &str) -> Fingerprint {
        Fingerprint::digest(name)
    }

    async fn open_stub(cache: &InstanceCache, name: &str, stub: Arc<StubSource>) -> SharedSource {
        cache
            .get_or_open(key(name), || async move { Ok(stub as SharedSource) })
            .await
            .unwrap()
    }

    /// Let spawned shutdown tasks run after the clock moves
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_reuses_live_instance() {
        let cache = cache(2);
        let opens = AtomicUsize::new(0);
        let opens = &opens;
        let stub = Arc::new(StubSource::default());

        for _ in 0..3 {
            let stub = stub.clone();
            cache
                .get_or_open(key("a"), || async move {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Ok(stub as SharedSource)
                })
                .await
                .unwrap();
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.opens, 1);
        assert_eq!(stats.reuses, 2);
    }

    #[tokio::test]
    async fn test_open_failure_is_not_cached() {
        let cache = cache(2);

        let err = cache
            .get_or_open(key("a"), || async {
                Err(CacheError::OpenError("missing file".to_string()))
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err, CacheError::OpenError("missing file".to_string()));
        assert!(cache.is_empty().await);

        open_stub(&cache, "a", Arc::new(StubSource::default())).await;
        assert!(cache.contains(&key("a")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_defers_shutdown() {
        let cache = cache(1);
        let first = Arc::new(StubSource::default());
        open_stub(&cache, "a", first.clone()).await;
        open_stub(&cache, "b", Arc::new(StubSource::default())).await;

        assert!(!cache.contains(&key("a")).await);
        assert_eq!(cache.stats().await.pending_shutdown, 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(first.shutdowns.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(first.shutdowns.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.shutdowns, 1);
        assert_eq!(stats.pending_shutdown, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_counts_from_eviction() {
        let cache = cache(1);
        let first = Arc::new(StubSource::default());
        open_stub(&cache, "a", first.clone()).await;
        open_stub(&cache, "b", Arc::new(StubSource::default())).await;

        // the clock moves before the shutdown task is ever polled
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        assert_eq!(first.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.pending_shutdown, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readoption_cancels_shutdown() {
        let cache = cache(1);
        let first = Arc::new(StubSource::default());
        open_stub(&cache, "a", first.clone()).await;
        open_stub(&cache, "b", Arc::new(StubSource::default())).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;

        // re-requesting "a" must not open a new instance
        let again = cache
            .get_or_open(key("a"), || async {
                Err(CacheError::OpenError("should not reopen".to_string()))
            })
            .await
            .unwrap();
        let first_dyn: SharedSource = first.clone();
        assert!(Arc::ptr_eq(&again, &first_dyn));

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(first.shutdowns.load(Ordering::SeqCst), 0);

        let stats = cache.stats().await;
        assert_eq!(stats.resurrections, 1);
        // "b" was evicted to make room for "a"
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.shutdowns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_follows_last_access() {
        let cache = cache(2);
        let a = Arc::new(StubSource::default());
        let b = Arc::new(StubSource::default());
        open_stub(&cache, "a", a.clone()).await;
        open_stub(&cache, "b", b.clone()).await;

        // touch "a" so "b" becomes least recently used
        open_stub(&cache, "a", a.clone()).await;
        open_stub(&cache, "c", Arc::new(StubSource::default())).await;

        assert!(cache.contains(&key("a")).await);
        assert!(!cache.contains(&key("b")).await);
        assert!(cache.contains(&key("c")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_failure_is_logged_not_propagated() {
        let cache = cache(1);
        let failing = Arc::new(StubSource {
            fail_shutdown: true,
            ..Default::default()
        });
        open_stub(&cache, "a", failing.clone()).await;
        open_stub(&cache, "b", Arc::new(StubSource::default())).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        assert_eq!(failing.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().await.shutdown_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_pending_and_close() {
        let cache = cache(1);
        let a = Arc::new(StubSource::default());
        let b = Arc::new(StubSource::default());
        open_stub(&cache, "a", a.clone()).await;
        open_stub(&cache, "b", b.clone()).await;

        assert_eq!(cache.flush_pending().await, 1);
        assert_eq!(a.shutdowns.load(Ordering::SeqCst), 1);

        // the aborted timer must not shut "a" down a second time
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(a.shutdowns.load(Ordering::SeqCst), 1);

        assert_eq!(cache.close().await, 1);
        assert_eq!(b.shutdowns.load(Ordering::SeqCst), 1);
        assert!(cache.is_closed().await);

        let err = cache
            .get_or_open(key("c"), || async { Ok(Arc::new(StubSource::default()) as SharedSource) })
            .await
            .err();
        assert_eq!(err, Some(CacheError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_states() {
        let cache = cache(1);
        open_stub(&cache, "a", Arc::new(StubSource::default())).await;
        open_stub(&cache, "b", Arc::new(StubSource::default())).await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].fingerprint, key("b"));
        assert_eq!(snapshot[0].state, InstanceState::Live);
        assert!(matches!(
            snapshot[1].state,
            InstanceState::PendingShutdown { .. }
        ));
    }
}
