//! Runnable fishcache peer node.
//!
//! Membership comes either from a static `--peers` list or from an etcd registry
//! (`--etcd`), in which case the node registers itself under a leased record and
//! follows membership changes by rebuilding its ring.
use std::panic::{set_hook, take_hook};
use std::process;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use fishcache::config::{EtcdConfig, DEFAULT_SERVICE_NAME};
use fishcache::error::CacheError;
use fishcache::group::{new_group, Group};
use fishcache::server::Server;

/// Command line flags of a fishcache node.
#[derive(Parser)]
#[command(name = "fishcache-node", version, about = "A fishcache peer node")]
struct Args {
    /// The externally reachable ip:port of this node; also its identity on the ring.
    #[arg(long, value_name = "IP:PORT")]
    host: String,

    /// Static peer list (comma separated ip:port entries).
    #[arg(long, value_delimiter = ',', value_name = "PEERS")]
    peers: Vec<String>,

    /// Etcd endpoints enabling dynamic membership (comma separated).
    #[arg(long = "etcd", value_delimiter = ',', value_name = "ENDPOINTS")]
    etcd: Vec<String>,

    /// Service name used as registry prefix.
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    service: String,
}

/// The demo origin served by every node: a tiny immutable score table.
fn create_scores_group() -> Arc<Group> {
    new_group("scores", 2 << 10, |key: &str| {
        let score = match key {
            "Tom" => "630",
            "Jack" => "589",
            "Sam" => "567",
            _ => {
                log::info!("Load local key: {} failed", key);
                return Err(CacheError::not_found(key));
            }
        };
        log::info!("Load local key: {}", key);
        Ok(score.as_bytes().to_vec())
    })
}

/// Keeps the node registered and its ring in sync with the registry.
///
/// Spawns the leased registration, the membership watch and the refresh loop which
/// re-lists the peers on every tick. Losing the registry is unrecoverable and ends
/// the process with a non-zero exit code.
fn start_discovery(
    config: EtcdConfig,
    server: Arc<Server>,
    groups: Vec<Arc<Group>>,
    stop_register: mpsc::Receiver<()>,
) {
    let (update_tx, mut update_rx) = mpsc::channel(4);

    let register_config = config.clone();
    let register_address = server.address().to_owned();
    let register_update = update_tx.clone();
    fishcache::spawn!(async move {
        match fishcache::discovery::register(
            &register_config,
            &register_address,
            stop_register,
            register_update,
        )
        .await
        {
            Ok(()) => log::info!("Registration of {} ended.", register_address),
            Err(error) => {
                log::error!("Lost the service registry: {}", error);
                process::exit(1);
            }
        }
    });

    let watch_config = config.clone();
    fishcache::spawn!(async move {
        if let Err(error) = fishcache::discovery::watch(&watch_config, update_tx).await {
            log::error!("Lost the registry watch: {}", error);
            process::exit(1);
        }
    });

    fishcache::spawn!(async move {
        while update_rx.recv().await.is_some() {
            match fishcache::discovery::list_peers(&config).await {
                Ok(peers) => server.set_peers(&peers, &groups),
                Err(error) => log::error!("Failed to list the registered peers: {}", error),
            }
        }
    });
}

#[tokio::main]
async fn main() {
    // Installs a panic handler which crashes the whole process instead of trying to
    // survive with a missing tokio background thread. A dead sweeper or discovery task
    // would leave a node which looks healthy from the outside but silently rots, so we
    // crash on purpose and let an external watchdog restart a clean instance.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a thread. Crashing the whole process to enable a clean restart...");
        process::exit(-1);
    }));

    fishcache::init_logging();

    let args = Args::parse();
    if args.peers.is_empty() && args.etcd.is_empty() {
        log::error!("Either --peers or --etcd has to be provided.");
        process::exit(2);
    }

    log::info!(
        "><> FISHCACHE (v {}) running on {} core(s) in {} CPU(s)",
        fishcache::FISHCACHE_VERSION,
        num_cpus::get(),
        num_cpus::get_physical()
    );

    let scores = create_scores_group();
    let groups = vec![scores];

    let server = Arc::new(Server::new(&args.host));

    if !args.peers.is_empty() {
        server.set_peers(&args.peers, &groups);
    }

    let (stop_register_tx, stop_register_rx) = mpsc::channel(1);
    if !args.etcd.is_empty() {
        let config = EtcdConfig {
            endpoints: args.etcd.clone(),
            service_name: args.service.clone(),
            ..EtcdConfig::default()
        };
        start_discovery(config, server.clone(), groups.clone(), stop_register_rx);
    }

    // Stop gracefully on CTRL-C: de-register from the registry and let the accept
    // loop bleed out.
    let signal_server = server.clone();
    fishcache::spawn!(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received CTRL-C. Shutting down...");
            let _ = stop_register_tx.send(()).await;
            signal_server.stop();
        }
    });

    if let Err(error) = server.run().await {
        log::error!("Server terminated: {}", error);
        process::exit(1);
    }

    for group in &groups {
        group.stop();
    }
}
