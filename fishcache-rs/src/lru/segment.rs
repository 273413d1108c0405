//! One partition of the sharded LRU.
//!
//! A segment is a plain single-threaded data structure; the surrounding
//! [ShardedCache](crate::lru::ShardedCache) wraps each segment in its own reader/writer
//! lock. Recency is tracked through a [LinkedHashMap]: the front of the map is the least
//! recently used entry, the back the most recently used one.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::sync::Arc;
use std::time::Duration;

use linked_hash_map::LinkedHashMap;

use crate::value::Value;

/// Callback fired for every entry removed by LRU eviction or the expiry sweep.
///
/// The callback runs while the segment lock is held and must therefore not call back
/// into the cache it was registered on.
pub type EvictionCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// A cache entry together with the instant of its last read or write.
struct Entry {
    value: Value,
    updated_at: Instant,
}

impl Entry {
    /// Determines if the entry has outlived the given time to live.
    fn expired(&self, ttl: Duration, now: Instant) -> bool {
        self.updated_at + ttl < now
    }
}

/// A single LRU partition enforcing a byte budget.
///
/// The accounted size of an entry is `key.len() + value.len()`. A `max_bytes` of zero
/// disables the budget, which happens when the total cache budget is smaller than the
/// number of segments.
pub(crate) struct Segment {
    max_bytes: i64,
    now_bytes: i64,
    entries: LinkedHashMap<String, Entry>,
    on_evict: Option<EvictionCallback>,
}

impl Segment {
    pub fn new(max_bytes: i64, on_evict: Option<EvictionCallback>) -> Self {
        Segment {
            max_bytes,
            now_bytes: 0,
            entries: LinkedHashMap::new(),
            on_evict,
        }
    }

    /// Looks up the value stored for the given key.
    ///
    /// A hit promotes the entry to most recently used and refreshes its TTL clock. The
    /// instant of that refresh is returned along with the value.
    pub fn get(&mut self, key: &str) -> Option<(Value, Instant)> {
        let entry = self.entries.get_refresh(key)?;
        entry.updated_at = Instant::now();
        Some((entry.value.clone(), entry.updated_at))
    }

    /// Stores or replaces the value for the given key and enforces the byte budget.
    ///
    /// Both paths leave the entry at the most recently used position with a fresh
    /// TTL clock. Afterwards, least recently used entries are evicted until the
    /// segment fits its budget again.
    pub fn add(&mut self, key: &str, value: Value) {
        let new_bytes = key.len() as i64 + value.len() as i64;

        if let Some(entry) = self.entries.get_refresh(key) {
            let old_bytes = key.len() as i64 + entry.value.len() as i64;
            entry.value = value;
            entry.updated_at = Instant::now();
            self.now_bytes += new_bytes - old_bytes;
        } else {
            let entry = Entry {
                value,
                updated_at: Instant::now(),
            };
            self.entries.insert(key.to_owned(), entry);
            self.now_bytes += new_bytes;
        }

        while self.max_bytes > 0 && self.now_bytes > self.max_bytes {
            self.remove_oldest();
        }
    }

    /// Evicts the least recently used entry.
    fn remove_oldest(&mut self) {
        if let Some((key, entry)) = self.entries.pop_front() {
            self.now_bytes -= key.len() as i64 + entry.value.len() as i64;
            if let Some(callback) = &self.on_evict {
                callback(&key, &entry.value);
            }
        }
    }

    /// Removes every entry whose TTL clock ran out before the given instant.
    ///
    /// Recency order approximates expiry order, so most victims sit at the front of the
    /// map. Reads reorder entries though, therefore the whole segment is scanned.
    pub fn sweep_expired(&mut self, ttl: Duration, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired(ttl, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                self.now_bytes -= key.len() as i64 + entry.value.len() as i64;
                if let Some(callback) = &self.on_evict {
                    callback(&key, &entry.value);
                }
            }
        }
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the accounted payload bytes of this segment.
    pub fn bytes_used(&self) -> i64 {
        self.now_bytes
    }
}
