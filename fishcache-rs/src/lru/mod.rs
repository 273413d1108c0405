//! Provides the sharded, TTL aware LRU cache backing every group.
//!
//! The cache is partitioned into [DEFAULT_NUM_SEGMENTS] independent segments, each with
//! its own reader/writer lock and a proportional share of the total byte budget. Keys are
//! routed to segments by an FNV-1a hash, which is fast, spreads keys evenly and stays
//! stable for the lifetime of the process. This is purely a lock-spreading device and
//! unrelated to the consistent hash that routes keys between peers.
//!
//! A background task sweeps expired entries out of all segments every
//! [cleanup interval](ShardedCache::set_cleanup_interval). The sweeper runs until
//! [stop](ShardedCache::stop) is called or the cache is dropped.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use fnv::FnvHasher;
use tokio::sync::broadcast;

use crate::value::Value;

mod segment;

pub use segment::EvictionCallback;
use segment::Segment;

/// Time to live applied to entries unless re-configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Interval in which the expiry sweeper visits all segments.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Number of independent cache segments.
pub const DEFAULT_NUM_SEGMENTS: usize = 16;

/// Shared control block consumed by the sweeper task.
struct SweeperControl {
    cleanup_interval: Duration,
    stop: Option<broadcast::Sender<()>>,
}

/// A concurrent, size constrained cache partitioned into independent LRU segments.
///
/// Note that creating a cache spawns the expiry sweeper and therefore requires a running
/// tokio runtime.
pub struct ShardedCache {
    segments: Arc<Vec<RwLock<Segment>>>,
    ttl: Arc<Mutex<Duration>>,
    control: Mutex<SweeperControl>,
    reads: AtomicU64,
    hits: AtomicU64,
}

impl ShardedCache {
    /// Creates a cache with the given total byte budget, split evenly across all
    /// segments.
    ///
    /// The optional callback fires for every entry removed by LRU eviction or the
    /// expiry sweep. It runs under the segment lock and must not call back into this
    /// cache.
    pub fn new(max_bytes: i64, on_evict: Option<EvictionCallback>) -> Self {
        let segment_max_bytes = max_bytes / DEFAULT_NUM_SEGMENTS as i64;
        let segments: Vec<RwLock<Segment>> = (0..DEFAULT_NUM_SEGMENTS)
            .map(|_| RwLock::new(Segment::new(segment_max_bytes, on_evict.clone())))
            .collect();

        let cache = ShardedCache {
            segments: Arc::new(segments),
            ttl: Arc::new(Mutex::new(DEFAULT_TTL)),
            control: Mutex::new(SweeperControl {
                cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
                stop: None,
            }),
            reads: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        };

        cache.spawn_sweeper();
        cache
    }

    /// Routes a key to its segment.
    fn segment_index(&self, key: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.segments.len() as u64) as usize
    }

    /// Looks up the value stored for the given key.
    ///
    /// A hit promotes the entry within its segment and refreshes its TTL clock, hence
    /// the write lock.
    pub fn get(&self, key: &str) -> Option<(Value, Instant)> {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);

        let result = self.segments[self.segment_index(key)]
            .write()
            .unwrap()
            .get(key);

        if result.is_some() {
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Stores or replaces the value for the given key.
    pub fn add(&self, key: &str, value: Value) {
        self.segments[self.segment_index(key)]
            .write()
            .unwrap()
            .add(key, value);
    }

    /// Returns the total number of entries across all segments.
    ///
    /// The segments are visited one after another, so the result is approximate while
    /// writes are in flight.
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| segment.read().unwrap().len())
            .sum()
    }

    /// Determines if the cache holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the accounted payload bytes across all segments.
    pub fn bytes_used(&self) -> i64 {
        self.segments
            .iter()
            .map(|segment| segment.read().unwrap().bytes_used())
            .sum()
    }

    /// Returns the total number of lookups performed.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups which found a live entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads() {
            0 => 0.,
            reads => self.hits() as f32 / reads as f32 * 100.,
        }
    }

    /// Changes the time to live applied by the expiry sweeper.
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.lock().unwrap() = ttl;
    }

    /// Changes the sweep interval.
    ///
    /// The current sweeper is stopped and a fresh one with the new interval is spawned.
    pub fn set_cleanup_interval(&self, interval: Duration) {
        {
            let mut control = self.control.lock().unwrap();
            if let Some(stop) = control.stop.take() {
                let _ = stop.send(());
            }
            control.cleanup_interval = interval;
        }

        self.spawn_sweeper();
    }

    /// Stops the expiry sweeper.
    ///
    /// The cached data remains accessible, only the background expiry ends.
    pub fn stop(&self) {
        let mut control = self.control.lock().unwrap();
        if let Some(stop) = control.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Spawns a sweeper task which periodically expunges expired entries.
    ///
    /// The task ends once a stop signal arrives or the cache (and with it the sender)
    /// is dropped.
    fn spawn_sweeper(&self) {
        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let segments = self.segments.clone();
        let ttl = self.ttl.clone();

        let cleanup_interval = {
            let mut control = self.control.lock().unwrap();
            control.stop = Some(stop_tx);
            control.cleanup_interval
        };

        crate::spawn!(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(cleanup_interval) => {
                        let ttl = *ttl.lock().unwrap();
                        let now = Instant::now();
                        for segment in segments.iter() {
                            segment.write().unwrap().sweep_expired(ttl, now);
                        }
                    }
                    _ = stop_rx.recv() => return,
                }
            }
        });
    }
}

impl Drop for ShardedCache {
    fn drop(&mut self) {
        self.stop();
    }
}
