//! Duplicate suppression for inbound packets
//!
//! Rebroadcasting nodes and reconnects can hand the relay the same packet
//! more than once. Packets are identified by `(sender, packet_id)` and
//! remembered in an LRU with a TTL so a repeat inside the window is dropped.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default number of remembered packets
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Default window in which a repeat counts as duplicate
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);

/// Key for deduplication cache entries
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct PacketKey {
    /// Sender node number
    pub from: u32,
    /// Packet id
    pub packet_id: u32,
}

impl std::fmt::Display for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}:{:08x}", self.from, self.packet_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    first_seen: Instant,
    seen_count: u32,
}

/// LRU-based deduplication cache with TTL expiration
#[derive(Debug)]
pub struct DeduplicationCache {
    cache: Mutex<LruCache<PacketKey, CacheEntry>>,
    ttl: Duration,
}

impl DeduplicationCache {
    /// Create a new deduplication cache with default settings
    pub fn new() -> Self {
        Self::with_capacity_and_ttl(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL)
    }

    /// Create with custom capacity and TTL
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    /// Record a packet; returns `true` when it was already seen within the TTL
    pub fn check_and_record(&self, from: u32, packet_id: u32) -> bool {
        let key = PacketKey { from, packet_id };
        let now = Instant::now();
        let mut cache = self.cache.lock();

        if let Some(entry) = cache.get_mut(&key) {
            if now.duration_since(entry.first_seen) > self.ttl {
                trace!(key = %key, "Cache entry expired, treating as new");
                entry.first_seen = now;
                entry.seen_count = 1;
                return false;
            }

            entry.seen_count += 1;
            debug!(key = %key, seen_count = entry.seen_count, "Duplicate packet dropped");
            return true;
        }

        cache.put(
            key,
            CacheEntry {
                first_seen: now,
                seen_count: 1,
            },
        );
        false
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl Default for DeduplicationCache {
    fn default() -> Self {
        Self::new()
    }
}
