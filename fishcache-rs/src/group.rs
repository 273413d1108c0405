//! Provides the public entry point of the cache: named groups.
//!
//! A group is a cache namespace bound to one user supplied loader and one local sharded
//! cache. Groups are registered in a process-wide registry so that the peer server can
//! dispatch incoming requests by group name.
//!
//! A lookup walks three stations: the local cache (hit returns immediately), the ring
//! (a non-self owner is asked via RPC) and finally the local loader. Remote fetches and
//! loader invocations are funneled through a [SingleFlight] so that a hot missing key
//! produces exactly one origin load per node, no matter how many callers pile up.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;

use crate::error::CacheError;
use crate::flight::SingleFlight;
use crate::lru::{EvictionCallback, ShardedCache};
use crate::value::Value;

/// Memo lifetime for coalesced loads; generous enough to blunt retry storms on a
/// failing origin without serving noticeably stale errors.
const GROUP_MEMO_TTL: Duration = Duration::from_secs(5);

lazy_static! {
    /// The process-wide registry of all groups, keyed by name.
    static ref GROUPS: RwLock<HashMap<String, Arc<Group>>> = RwLock::new(HashMap::new());
}

/// Loads authoritative bytes for a key from the origin source.
///
/// Implemented for every matching closure, so a plain `|key| ...` works:
///
/// ```
/// # use fishcache::error::CacheError;
/// let loader = |key: &str| match key {
///     "Tom" => Ok(b"630".to_vec()),
///     _ => Err(CacheError::not_found(key)),
/// };
/// # let _ = loader;
/// ```
pub trait Loader: Send + Sync {
    /// Returns the bytes stored for the given key, or an error (typically
    /// [CacheError::NotFound]) if the origin has no such key.
    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError>;
}

impl<F> Loader for F
where
    F: Fn(&str) -> Result<Vec<u8>, CacheError> + Send + Sync,
{
    fn load(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self(key)
    }
}

/// Fetches a cached value from one specific remote peer.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    /// Asks the peer for the value of `key` within `group`.
    async fn get(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError>;
}

/// Picks the peer owning a key, if that peer is not the local node.
pub trait PeerPicker: Send + Sync {
    /// Returns a client for the owning peer, or **None** if the local node owns the
    /// key (or no peers are known).
    fn pick(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// A named cache namespace bound to one loader and one local cache.
pub struct Group {
    name: String,
    loader: Box<dyn Loader>,
    cache: ShardedCache,
    flight: SingleFlight,
    peers: RwLock<Option<Arc<dyn PeerPicker>>>,
}

/// Creates a group and registers it in the process-wide registry.
///
/// Note that this spawns the cache's expiry sweeper and therefore requires a running
/// tokio runtime.
///
/// # Panics
/// Panics if `max_bytes` is not positive or a group with the same name already exists.
pub fn new_group(name: &str, max_bytes: i64, loader: impl Loader + 'static) -> Arc<Group> {
    if max_bytes <= 0 {
        panic!("cache size must be positive, got {}", max_bytes);
    }

    let mut groups = GROUPS.write().unwrap();
    if groups.contains_key(name) {
        panic!("a group named {:?} is already registered", name);
    }

    let on_evict: EvictionCallback = Arc::new(|key: &str, _value: &Value| {
        log::debug!("Cache entry evicted: key={}", key);
    });

    let group = Arc::new(Group {
        name: name.to_owned(),
        loader: Box::new(loader),
        cache: ShardedCache::new(max_bytes, Some(on_evict)),
        flight: SingleFlight::new(GROUP_MEMO_TTL),
        peers: RwLock::new(None),
    });

    let _ = groups.insert(name.to_owned(), group.clone());
    group
}

/// Looks up a group by name in the process-wide registry.
pub fn get_group(name: &str) -> Option<Arc<Group>> {
    GROUPS.read().unwrap().get(name).cloned()
}

impl Group {
    /// Returns the name under which this group is registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value stored for the given key.
    ///
    /// Serves from the local cache when possible. On a miss, the owning peer is
    /// consulted (unless that is us), and as a last resort the user loader fills the
    /// cache. Concurrent misses for the same key are coalesced into a single load.
    pub async fn get(&self, key: &str) -> Result<Value, CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("key is empty".to_owned()));
        }

        if let Some((value, _)) = self.cache.get(key) {
            if !value.is_expired(Instant::now()) {
                return Ok(value);
            }
        }

        self.load(key).await
    }

    /// Loads a missing key, deduplicated per key across all concurrent callers.
    async fn load(&self, key: &str) -> Result<Value, CacheError> {
        self.flight
            .run(key, || async {
                if let Some(peer) = self.pick_peer(key) {
                    match peer.get(&self.name, key).await {
                        // The remote owner is the cache of record for this key, so the
                        // bytes are intentionally not copied into the local cache.
                        Ok(bytes) => return Ok(Value::new(&bytes)),
                        Err(error) => log::warn!(
                            "Remote fetch of {:?} failed, falling back to the local loader: {}",
                            key,
                            error
                        ),
                    }
                }

                self.get_locally(key)
            })
            .await
    }

    /// Invokes the user loader and populates the local cache.
    fn get_locally(&self, key: &str) -> Result<Value, CacheError> {
        let bytes = self.loader.load(key)?;
        let value = Value::new(&bytes);
        self.cache.add(key, value.clone());
        Ok(value)
    }

    /// Asks the registered picker for the remote owner of the key.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        self.peers.read().unwrap().as_ref()?.pick(key)
    }

    /// Binds (or re-binds) the peer picker consulted on cache misses.
    ///
    /// Passing **None** unbinds the picker, turning the group into a purely local
    /// cache. Re-binding is allowed since the membership may change at any time.
    pub fn register_peers(&self, picker: Option<Arc<dyn PeerPicker>>) {
        let mut peers = self.peers.write().unwrap();
        if peers.is_some() && picker.is_some() {
            log::debug!("Re-binding the peer picker of group {:?}...", self.name);
        }
        *peers = picker;
    }

    /// Returns the number of entries in the local cache.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Returns the hit rate of the local cache in percent.
    pub fn hit_rate(&self) -> f32 {
        self.cache.hit_rate()
    }

    /// Stops the background expiry sweeper of the local cache.
    pub fn stop(&self) {
        self.cache.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_async;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// The canonical origin data set used throughout the tests.
    fn scores_loader(invocations: Arc<AtomicUsize>) -> impl Loader + 'static {
        move |key: &str| {
            let _ = invocations.fetch_add(1, Ordering::SeqCst);
            match key {
                "Tom" => Ok(b"630".to_vec()),
                "Jack" => Ok(b"589".to_vec()),
                "Sam" => Ok(b"567".to_vec()),
                _ => Err(CacheError::not_found(key)),
            }
        }
    }

    #[test]
    fn hits_are_served_without_the_loader() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-hit", 2 << 10, scores_loader(invocations.clone()));

            let value = group.get("Tom").await.unwrap();
            assert_eq!(value.to_string_lossy(), "630");
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // The second read is a pure cache hit.
            let value = group.get("Tom").await.unwrap();
            assert_eq!(value.to_string_lossy(), "630");
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            group.stop();
        });
    }

    #[test]
    fn misses_fill_the_cache_through_the_loader() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-miss", 2 << 10, scores_loader(invocations.clone()));

            assert_eq!(group.get("Jack").await.unwrap().to_string_lossy(), "589");
            assert_eq!(group.cache_len(), 1);

            assert_eq!(group.get("Jack").await.unwrap().to_string_lossy(), "589");
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            group.stop();
        });
    }

    #[test]
    fn absent_keys_report_not_found_once_per_memo_window() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-absent", 2 << 10, scores_loader(invocations.clone()));

            let error = group.get("Tam").await.unwrap_err();
            assert!(error.is_not_found());

            // The immediate retry is answered by the single-flight memo.
            let error = group.get("Tam").await.unwrap_err();
            assert!(error.is_not_found());
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // Errors never make it into the LRU itself.
            assert_eq!(group.cache_len(), 0);

            group.stop();
        });
    }

    #[test]
    fn empty_keys_are_rejected() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-empty", 2 << 10, scores_loader(invocations.clone()));

            let error = group.get("").await.unwrap_err();
            assert!(matches!(error, CacheError::InvalidArgument(_)));
            assert_eq!(invocations.load(Ordering::SeqCst), 0);

            group.stop();
        });
    }

    #[test]
    #[should_panic(expected = "cache size must be positive")]
    fn a_non_positive_cache_size_panics() {
        test_async(async {
            let _ = new_group("scores-invalid", 0, |key: &str| {
                Err::<Vec<u8>, _>(CacheError::not_found(key))
            });
        });
    }

    #[test]
    fn groups_are_discoverable_by_name() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-registry", 2 << 10, scores_loader(invocations));

            let found = get_group("scores-registry").unwrap();
            assert_eq!(found.name(), "scores-registry");
            assert!(get_group("no-such-group").is_none());

            group.stop();
        });
    }

    /// A picker/getter pair which records every remote fetch.
    struct RecordingPeer {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PeerGetter for RecordingPeer {
        async fn get(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError> {
            self.calls
                .lock()
                .unwrap()
                .push((group.to_owned(), key.to_owned()));
            Ok(b"remote-value".to_vec())
        }
    }

    struct SinglePeerPicker {
        peer: Arc<RecordingPeer>,
    }

    impl PeerPicker for SinglePeerPicker {
        fn pick(&self, _key: &str) -> Option<Arc<dyn PeerGetter>> {
            Some(self.peer.clone())
        }
    }

    #[test]
    fn remote_owners_are_consulted_and_do_not_fill_the_local_cache() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-remote", 2 << 10, scores_loader(invocations.clone()));

            let peer = Arc::new(RecordingPeer {
                calls: Mutex::new(Vec::new()),
            });
            group.register_peers(Some(Arc::new(SinglePeerPicker { peer: peer.clone() })));

            let value = group.get("Tom").await.unwrap();
            assert_eq!(value.to_string_lossy(), "remote-value");

            // The peer answered, so the local loader stayed idle and the local cache
            // remains empty: the remote owner is the cache of record.
            assert_eq!(invocations.load(Ordering::SeqCst), 0);
            assert_eq!(group.cache_len(), 0);
            assert_eq!(
                *peer.calls.lock().unwrap(),
                vec![("scores-remote".to_owned(), "Tom".to_owned())]
            );

            group.stop();
        });
    }

    /// A picker whose peer always fails, forcing the local fallback.
    struct FailingPeerPicker;

    struct FailingPeer;

    #[async_trait]
    impl PeerGetter for FailingPeer {
        async fn get(&self, _group: &str, _key: &str) -> Result<Vec<u8>, CacheError> {
            Err(CacheError::PeerUnavailable("connection refused".to_owned()))
        }
    }

    impl PeerPicker for FailingPeerPicker {
        fn pick(&self, _key: &str) -> Option<Arc<dyn PeerGetter>> {
            Some(Arc::new(FailingPeer))
        }
    }

    #[test]
    fn remote_failures_fall_back_to_the_local_loader() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-fallback", 2 << 10, scores_loader(invocations.clone()));
            group.register_peers(Some(Arc::new(FailingPeerPicker)));

            let value = group.get("Sam").await.unwrap();
            assert_eq!(value.to_string_lossy(), "567");
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // The fallback populated the local cache.
            assert_eq!(group.cache_len(), 1);

            group.stop();
        });
    }

    #[test]
    fn the_picker_is_rebindable_and_unbindable() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let group = new_group("scores-rebind", 2 << 10, scores_loader(invocations.clone()));

            group.register_peers(Some(Arc::new(FailingPeerPicker)));
            group.register_peers(None);

            // With the picker unbound, the loader answers directly.
            let value = group.get("Tom").await.unwrap();
            assert_eq!(value.to_string_lossy(), "630");
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            group.stop();
        });
    }
}
