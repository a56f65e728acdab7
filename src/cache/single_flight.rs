//! Keyed request coalescing
//!
//! For a given key at most one producer runs at a time. Callers arriving while
//! it runs subscribe to its outcome instead of starting their own, and every
//! subscriber receives the same `Result`, success or failure.
//!
//! ```text
//! caller A ─┐
//!           │                        producer
//! caller B ─┼──► SingleFlight ─────► (runs once)
//!           │        │                   │
//! caller C ─┘        ▼                   ▼
//!              [A, B, C receive   ◄──────┘
//!               the same result]
//! ```
//!
//! Nothing is remembered once the producer finishes: the next caller for the
//! key starts a fresh cycle. Caching completed results is the job of
//! [`ResultCache`](crate::cache::ResultCache).

use crate::error::{CacheError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Statistics for monitoring coalescing effectiveness
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightStats {
    /// Total requests received
    pub total_requests: u64,
    /// Requests that waited on a producer already in flight
    pub coalesced_requests: u64,
    /// Requests that became the producer
    pub leader_requests: u64,
}

impl FlightStats {
    /// Returns the coalescing ratio (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.coalesced_requests as f64 / self.total_requests as f64
        }
    }
}

/// In-flight table mapping a key to the channel its waiters listen on
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
{
    in_flight: DashMap<K, broadcast::Sender<Result<V>>>,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    leader_requests: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: DashMap::new(),
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
            leader_requests: AtomicU64::new(0),
        }
    }

    /// Run `work` for `key`, or wait for the run already in flight
    ///
    /// `work` is only invoked when this caller becomes the producer. If the
    /// producer's future is dropped before finishing, its waiters fail with
    /// [`CacheError::Abandoned`] and the key is free again.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let waiter = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                debug!(key = ?key, "Coalescing request onto in-flight producer");
                Some(entry.get().subscribe())
            }
            Entry::Vacant(entry) => {
                // one message is ever sent per cycle
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx);
                self.leader_requests.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Abandoned {
                    key: format!("{:?}", key),
                }),
            };
        }

        let mut guard = FlightGuard {
            in_flight: &self.in_flight,
            key: Some(key),
        };
        let result = work().await;
        guard.complete(result.clone());
        result
    }

    /// Whether a producer is currently running for `key`
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of keys with a producer running
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns a snapshot of the current statistics
    pub fn stats(&self) -> FlightStats {
        FlightStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            leader_requests: self.leader_requests.load(Ordering::Relaxed),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the key when the producer finishes or is dropped
struct FlightGuard<'a, K, V>
where
    K: Eq + Hash,
{
    in_flight: &'a DashMap<K, broadcast::Sender<Result<V>>>,
    key: Option<K>,
}

impl<K, V> FlightGuard<'_, K, V>
where
    K: Eq + Hash + Debug,
{
    fn complete(&mut self, result: Result<V>) {
        let Some(key) = self.key.take() else {
            return;
        };
        // Removing before sending means a caller that misses this broadcast
        // finds the key vacant and starts its own cycle.
        if let Some((_, tx)) = self.in_flight.remove(&key) {
            let waiters = tx.receiver_count();
            let _ = tx.send(result);
            if waiters > 0 {
                debug!(key = ?key, waiters, "Broadcast result to coalesced waiters");
            }
        }
    }
}

impl<K, V> Drop for FlightGuard<'_, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            // dropping the sender wakes every waiter with a closed channel
            self.in_flight.remove(&key);
        }
    }
}
