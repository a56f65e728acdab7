//! Result cache entries with TTL support

use crate::cache::types::Fingerprint;
use std::time::Duration;
use tokio::time::Instant;

/// A cached fetch result with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cache key
    pub fingerprint: Fingerprint,

    /// The cached value
    pub value: V,

    /// Entry metadata
    pub metadata: CacheMetadata,
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    /// When the entry was stored
    pub created_at: Instant,

    /// When the entry was last read
    pub accessed_at: Instant,

    /// When the entry stops being served
    pub expires_at: Instant,

    /// Number of hits served from this entry
    pub access_count: u64,

    /// Weight charged against the byte budget
    pub size_bytes: usize,

    /// Position in the recency order; larger is more recent
    pub(crate) recency: u64,
}

impl<V> CacheEntry<V> {
    /// Create a new cache entry that expires after `ttl`
    pub fn new(fingerprint: Fingerprint, value: V, size_bytes: usize, ttl: Duration) -> Self {
        let now = Instant::now();

        Self {
            fingerprint,
            value,
            metadata: CacheMetadata {
                created_at: now,
                accessed_at: now,
                expires_at: now + ttl,
                access_count: 0,
                size_bytes,
                recency: 0,
            },
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.metadata.expires_at
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        self.metadata
            .expires_at
            .checked_duration_since(Instant::now())
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self, recency: u64) {
        self.metadata.accessed_at = Instant::now();
        self.metadata.access_count += 1;
        self.metadata.recency = recency;
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.metadata.created_at)
    }
}
