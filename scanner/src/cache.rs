//! Short-lived transaction cache
//!
//! Sits beside the chain client so that retries and restarts over an
//! already-seen range do not re-decode (or re-fetch details for) the same
//! transactions. A miss always falls through to the chain; a hit
//! short-circuits decode only when the cached entry was decoded against the
//! same block-height context, since unlock-height resolution depends on it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use protocol_core::ParsedTransaction;

/// Decode outcome for one transaction. `parsed` is `None` for transactions
/// that carried no protocol records; caching that fact is the point, since
/// most chain transactions are not ours.
#[derive(Debug, Clone)]
pub struct TxCacheEntry {
    pub parsed: Option<ParsedTransaction>,
    pub decoded_at_height: Option<i64>,
}

struct CacheSlot {
    entry: TxCacheEntry,
    inserted_at: Instant,
}

pub struct TransactionCache {
    capacity: usize,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheSlot>>,
}

impl TransactionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Returns the cached decode result only when the height context
    /// matches; expired entries are dropped on access.
    pub fn get(&self, txid: &str, height_context: Option<i64>) -> Option<TxCacheEntry> {
        let mut entries = self.entries.write();
        let expired = match entries.get(txid) {
            None => return None,
            Some(slot) => slot.inserted_at.elapsed() > self.ttl,
        };
        if expired {
            entries.remove(txid);
            return None;
        }
        let slot = entries.get(txid)?;
        if slot.entry.decoded_at_height != height_context {
            return None;
        }
        Some(slot.entry.clone())
    }

    pub fn insert(&self, txid: &str, entry: TxCacheEntry) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity && !entries.contains_key(txid) {
            // evict the oldest entry
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, slot)| slot.inserted_at)
                .map(|(txid, _)| txid.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(txid.to_string(), CacheSlot { entry, inserted_at: Instant::now() });
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(height: Option<i64>) -> TxCacheEntry {
        TxCacheEntry { parsed: None, decoded_at_height: height }
    }

    #[test]
    fn hit_requires_matching_height_context() {
        let cache = TransactionCache::new(10, Duration::from_secs(60));
        cache.insert("tx1", entry(Some(100)));

        assert!(cache.get("tx1", Some(100)).is_some());
        // same txid decoded against a different height must not short-circuit
        assert!(cache.get("tx1", Some(101)).is_none());
        assert!(cache.get("tx1", None).is_none());
        // entry survives a context mismatch
        assert!(cache.get("tx1", Some(100)).is_some());
    }

    #[test]
    fn miss_falls_through() {
        let cache = TransactionCache::new(10, Duration::from_secs(60));
        assert!(cache.get("never-seen", Some(1)).is_none());
    }

    #[test]
    fn expired_entries_are_dropped_on_access() {
        let cache = TransactionCache::new(10, Duration::from_millis(0));
        cache.insert("tx1", entry(Some(100)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("tx1", Some(100)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = TransactionCache::new(2, Duration::from_secs(60));
        cache.insert("tx1", entry(Some(1)));
        cache.insert("tx2", entry(Some(2)));
        cache.insert("tx3", entry(Some(3)));
        assert_eq!(cache.len(), 2);
        // the newest entry always survives eviction
        assert!(cache.get("tx3", Some(3)).is_some());
    }

    #[test]
    fn reinserting_updates_in_place() {
        let cache = TransactionCache::new(2, Duration::from_secs(60));
        cache.insert("tx1", entry(Some(1)));
        cache.insert("tx1", entry(Some(2)));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("tx1", Some(2)).is_some());
    }
}
