//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Fixed-width digest used as the sole key of both caches and the lock tables
///
/// Collisions between distinct inputs are not detected.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest arbitrary bytes
    pub fn digest(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hasher.finalize().into())
    }

    /// Digest the canonical JSON form of a value
    ///
    /// Maps must be ordered (`BTreeMap`, `serde_json::Map`) for the result to
    /// be independent of insertion order.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> crate::error::Result<Self> {
        let canonical = serde_json::to_vec(value)?;
        Ok(Self::digest(canonical))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Statistics for result cache monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Number of entries currently in cache
    pub entries: usize,

    /// Total size of cached data in bytes
    pub size_bytes: usize,

    /// Number of evictions due to the byte budget
    pub evictions_size: u64,

    /// Number of evictions due to TTL expiration
    pub evictions_ttl: u64,

    /// Number of manual invalidations
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }

    /// Average cache entry size in bytes
    pub fn avg_entry_size(&self) -> usize {
        if self.entries == 0 {
            0
        } else {
            self.size_bytes / self.entries
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, size: {} bytes, evictions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.size_bytes,
            self.total_evictions()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Fingerprint::digest("fetch_tile:abc");
        let b = Fingerprint::digest("fetch_tile:abc");
        let c = Fingerprint::digest("fetch_tile:abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_fingerprint_of_ordered_map_ignores_insertion_order() {
        let mut first = BTreeMap::new();
        first.insert("b", 2);
        first.insert("a", 1);

        let mut second = BTreeMap::new();
        second.insert("a", 1);
        second.insert("b", 2);

        assert_eq!(
            Fingerprint::of(&first).unwrap(),
            Fingerprint::of(&second).unwrap()
        );
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 80.0);

        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            hits: 100,
            misses: 50,
            entries: 75,
            size_bytes: 1500,
            evictions_size: 10,
            evictions_ttl: 5,
            invalidations: 3,
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("evictions: 15"));
        assert_eq!(stats.avg_entry_size(), 20);
    }
}
