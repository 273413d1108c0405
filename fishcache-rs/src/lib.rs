//! Fishcache is a distributed in-memory key-value cache organized as a ring of peers.
//!
//! # Introduction
//! Every node holds a size constrained, TTL aware local cache and knows the complete
//! membership of the ring. A client may ask any node for `(group, key)`: the node
//! serves local hits directly, asks the authoritative owner of the key over a thin
//! peer protocol otherwise, and as a last resort fills its cache from a user supplied
//! loader. Concurrent misses for the same key collapse into a single origin load.
//!
//! There is deliberately no cross-node consistency, replication or persistence: the
//! system is a cooperative cache in front of an authoritative origin, not a database.
//!
//! # Modules
//! * **[group]**: the public entry point. A [Group](group::Group) is a named cache
//!   namespace bound to one loader; groups live in a process-wide registry.
//! * **[lru]**: the local cache. Sixteen independent LRU segments under a shared byte
//!   budget, swept periodically for expired entries.
//! * **[ring]**: consistent hashing with virtual nodes, mapping keys to peers.
//! * **[flight]**: single-flight deduplication plus a short lived outcome memo.
//! * **[server] / [client] / [wire]**: the peer transport - a framed request/response
//!   protocol over TCP built on [tokio](https://tokio.rs/).
//! * **[discovery] / [config]**: optional etcd based membership with leased
//!   registrations and a change watch.
//!
//! # Example
//! ```no_run
//! use fishcache::error::CacheError;
//!
//! #[tokio::main]
//! async fn main() {
//!     let group = fishcache::new_group("scores", 2 << 10, |key: &str| match key {
//!         "Tom" => Ok(b"630".to_vec()),
//!         _ => Err(CacheError::not_found(key)),
//!     });
//!
//!     let value = group.get("Tom").await.unwrap();
//!     assert_eq!(value.to_string_lossy(), "630");
//! }
//! ```
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod flight;
pub mod group;
pub mod lru;
pub mod ring;
pub mod server;
pub mod value;
pub mod wire;

pub use error::CacheError;
pub use group::{get_group, new_group, Group, Loader, PeerGetter, PeerPicker};
pub use server::Server;
pub use value::Value;

/// Contains the version of the fishcache library.
pub const FISHCACHE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// Logs to stdout, which is all that is needed when running in containers. Safe to
/// call more than once, as integration tests initialize the framework repeatedly.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Info,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate fishcache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
