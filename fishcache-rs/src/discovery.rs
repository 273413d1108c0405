//! Glue between a node and the etcd service registry.
//!
//! Three duties: [register] keeps this node discoverable through a leased record with a
//! keepalive heartbeat, [list_peers] returns the current membership, and [watch] emits
//! a refresh tick whenever the membership changes. The caller (the node bootstrap)
//! reacts to a tick by re-listing the peers and rebuilding the ring via
//! [Server::set_peers](crate::server::Server::set_peers).
//!
//! Records are stored as `{service}/{addr}` with a small JSON body, bound to a short
//! lease: when the heartbeat stops (crash, partition, shutdown), the registry expires
//! the record by itself and the remaining peers converge on the shrunken ring.
use std::time::Duration;

use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::EtcdConfig;
use crate::error::CacheError;

/// Lifetime of the registration lease. The heartbeat renews it well before expiry.
const LEASE_TTL_SECONDS: i64 = 5;

/// Interval in which the lease is renewed.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

/// The JSON body stored for every registered peer.
#[derive(Serialize, Deserialize)]
struct ServiceRecord {
    addr: String,
    metadata: String,
}

fn registry_lost(context: &str, error: etcd_client::Error) -> CacheError {
    CacheError::RegistryLost(format!("{}: {}", context, error))
}

async fn connect(config: &EtcdConfig) -> Result<Client, CacheError> {
    let options = ConnectOptions::new().with_connect_timeout(config.timeout);
    Client::connect(&config.endpoints, Some(options))
        .await
        .map_err(|error| registry_lost("failed to connect to the registry", error))
}

/// Registers this node under `{service}/{addr}` and keeps the record alive.
///
/// Does not return during normal operation. Returns **Ok** once a stop signal arrives
/// (the record is removed on the way out) and **Err(RegistryLost)** when the
/// registry connection or the lease is lost; one refresh tick is sent on `update` as
/// soon as the registration is visible.
pub async fn register(
    config: &EtcdConfig,
    address: &str,
    mut stop: mpsc::Receiver<()>,
    update: mpsc::Sender<()>,
) -> Result<(), CacheError> {
    let mut client = connect(config).await?;

    let lease = client
        .lease_grant(LEASE_TTL_SECONDS, None)
        .await
        .map_err(|error| registry_lost("failed to create the registration lease", error))?;

    let record_key = format!("{}/{}", config.service_name, address);
    let record = ServiceRecord {
        addr: address.to_owned(),
        metadata: "weight:10;version:v1.0.0".to_owned(),
    };
    let record_json = serde_json::to_string(&record)
        .map_err(|error| CacheError::RegistryLost(format!("failed to encode the record: {}", error)))?;

    client
        .put(
            record_key.clone(),
            record_json,
            Some(PutOptions::new().with_lease(lease.id())),
        )
        .await
        .map_err(|error| registry_lost("failed to store the registration record", error))?;

    let (mut keeper, mut responses) = client
        .lease_keep_alive(lease.id())
        .await
        .map_err(|error| registry_lost("failed to start the lease keepalive", error))?;

    log::info!("Registered {} in the service registry...", address);
    let _ = update.send(()).await;

    let mut heartbeat = tokio::time::interval(KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.recv() => {
                log::info!("De-registering {} from the service registry...", address);
                let _ = client.delete(record_key.clone(), None).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                if let Err(error) = keeper.keep_alive().await {
                    let _ = client.delete(record_key.clone(), None).await;
                    return Err(registry_lost("failed to renew the registration lease", error));
                }
            }
            message = responses.message() => {
                match message {
                    Ok(Some(_)) => {
                        // The lease was renewed, nothing to do...
                    }
                    Ok(None) | Err(_) => {
                        let _ = client.delete(record_key.clone(), None).await;
                        return Err(CacheError::RegistryLost(
                            "the keepalive channel closed, lease revoked".to_owned(),
                        ));
                    }
                }
            }
        }
    }
}

/// Lists the addresses of all peers currently registered under the service prefix.
pub async fn list_peers(config: &EtcdConfig) -> Result<Vec<String>, CacheError> {
    let mut client = connect(config).await?;

    let response = client
        .get(
            config.service_name.clone(),
            Some(GetOptions::new().with_prefix()),
        )
        .await
        .map_err(|error| registry_lost("failed to list the registered peers", error))?;

    let mut peers = Vec::with_capacity(response.kvs().len());
    for kv in response.kvs() {
        match serde_json::from_slice::<ServiceRecord>(kv.value()) {
            Ok(record) => peers.push(record.addr),
            Err(error) => log::warn!(
                "Ignoring a malformed registry record under {:?}: {}",
                kv.key_str().unwrap_or("<binary>"),
                error
            ),
        }
    }

    Ok(peers)
}

/// Watches the service prefix and sends one tick on `update` per membership event.
///
/// Returns **Ok** once the receiving side of `update` is gone and **Err(RegistryLost)**
/// if the watch stream breaks down.
pub async fn watch(config: &EtcdConfig, update: mpsc::Sender<()>) -> Result<(), CacheError> {
    let mut client = connect(config).await?;

    let (_watcher, mut stream) = client
        .watch(
            config.service_name.clone(),
            Some(WatchOptions::new().with_prefix()),
        )
        .await
        .map_err(|error| registry_lost("failed to watch the service prefix", error))?;

    log::info!(
        "Watching service prefix {:?} for membership changes...",
        config.service_name
    );

    loop {
        match stream.message().await {
            Ok(Some(response)) => {
                // Adds, updates and removals all warrant re-listing the peers.
                for _event in response.events() {
                    if update.send(()).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(None) => {
                return Err(CacheError::RegistryLost(
                    "the registry watch stream ended".to_owned(),
                ));
            }
            Err(error) => {
                return Err(registry_lost("failed to read from the watch stream", error));
            }
        }
    }
}
