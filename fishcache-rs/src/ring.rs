//! Provides the consistent hash ring which maps keys to peer addresses.
//!
//! Every real peer contributes [DEFAULT_REPLICAS] virtual nodes to smooth out the key
//! distribution. A lookup hashes the key and walks the ring clockwise to the first
//! virtual node, wrapping around at the end. The ring is rebuilt from scratch on every
//! membership change; the current state lives behind an [ArcSwap] so that lookups on the
//! hot path never contend with a rebuild.
//!
//! The hash function defaults to CRC-32 (IEEE) and must be identical on all peers of a
//! ring, otherwise two nodes can disagree about the owner of a key and bounce requests
//! between each other.
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Number of virtual nodes placed on the ring per real peer.
pub const DEFAULT_REPLICAS: usize = 50;

/// Signature of the keyspace hash. Replaceable for tests which need a predictable ring.
pub type RingHashFn = fn(&[u8]) -> u32;

/// An immutable snapshot of the ring.
#[derive(Default)]
struct RingState {
    /// Virtual node hashes, ascending.
    hashes: Vec<u32>,
    /// Virtual node hash to peer address.
    nodes: HashMap<u32, String>,
}

/// Maps keys to peer addresses using consistent hashing with virtual nodes.
///
/// # Examples
/// ```
/// # use fishcache::ring::HashRing;
/// let ring = HashRing::new(50, None);
/// ring.add_nodes(&["10.0.0.1:2410".to_owned(), "10.0.0.2:2410".to_owned()]);
///
/// let owner = ring.pick("some-key").unwrap();
/// assert!(owner == "10.0.0.1:2410" || owner == "10.0.0.2:2410");
/// ```
pub struct HashRing {
    replicas: usize,
    hash: RingHashFn,
    state: ArcSwap<RingState>,
}

impl HashRing {
    /// Creates an empty ring with the given number of virtual nodes per peer.
    ///
    /// Passing no hash function selects CRC-32 (IEEE).
    pub fn new(replicas: usize, hash: Option<RingHashFn>) -> Self {
        HashRing {
            replicas: replicas.max(1),
            hash: hash.unwrap_or(crc32fast::hash),
            state: ArcSwap::from_pointee(RingState::default()),
        }
    }

    /// Rebuilds the ring for the given peer set.
    ///
    /// The peers are sorted before insertion so that colliding virtual node hashes are
    /// resolved the same way on every node. Virtual node `i` of peer `p` is placed at
    /// `hash(itoa(i) + p)`; on a collision across peers the later insertion wins.
    pub fn add_nodes(&self, nodes: &[String]) {
        let mut sorted: Vec<&String> = nodes.iter().collect();
        sorted.sort();

        let mut state = RingState {
            hashes: Vec::with_capacity(sorted.len() * self.replicas),
            nodes: HashMap::with_capacity(sorted.len() * self.replicas),
        };

        for node in sorted {
            for index in 0..self.replicas {
                let virtual_hash = (self.hash)(format!("{}{}", index, node).as_bytes());
                state.hashes.push(virtual_hash);
                let _ = state.nodes.insert(virtual_hash, node.clone());
            }
        }
        state.hashes.sort_unstable();

        self.state.store(Arc::new(state));
    }

    /// Returns the peer owning the given key, or **None** for an empty ring.
    pub fn pick(&self, key: &str) -> Option<String> {
        let state = self.state.load();
        if state.hashes.is_empty() {
            return None;
        }

        let key_hash = (self.hash)(key.as_bytes());

        // The owner is the first virtual node at or after the key, wrapping to the
        // start of the ring when the key hashes beyond the last node.
        let mut index = state.hashes.partition_point(|&hash| hash < key_hash);
        if index == state.hashes.len() {
            index = 0;
        }

        state.nodes.get(&state.hashes[index]).cloned()
    }

    /// Determines if the ring contains no nodes.
    pub fn is_empty(&self) -> bool {
        self.state.load().hashes.is_empty()
    }
}
