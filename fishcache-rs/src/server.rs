//! The server side of the peer transport, which doubles as the peer picker.
//!
//! Every node runs one [Server]. It answers `(group, key)` requests from other peers by
//! dispatching into the process-wide group registry, and it owns the routing state for
//! outgoing requests: the consistent hash ring plus one [PeerClient] per remote peer.
//! [Server::set_peers](Server::set_peers) rebuilds both whenever the membership changes
//! and binds the server as picker into the given groups.
//!
//! The accept and read loops poll with a short timeout so that a stop request is
//! noticed promptly, the way long running loops are shaped everywhere in this crate.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::client::PeerClient;
use crate::error::CacheError;
use crate::group::{get_group, Group, PeerGetter, PeerPicker};
use crate::ring::{HashRing, DEFAULT_REPLICAS};
use crate::wire::{GetRequest, GetResponse};

/// Timeout for waiting on a new incoming connection, so the accept loop can re-check
/// whether the server was stopped.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for waiting on incoming data within a connection.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Pre-allocated receive buffer size per connection.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Serves cached values to peers and routes outgoing requests through the ring.
pub struct Server {
    address: String,
    running: AtomicBool,
    ring: HashRing,
    clients: RwLock<HashMap<String, Arc<PeerClient>>>,
}

impl Server {
    /// Creates a server which will listen on the given `ip:port` address.
    ///
    /// The address is also this node's identity on the ring, so it has to be the one
    /// the other peers dial, not a wildcard bind address.
    pub fn new(address: &str) -> Self {
        Server {
            address: address.to_owned(),
            running: AtomicBool::new(false),
            ring: HashRing::new(DEFAULT_REPLICAS, None),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the address this server listens on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Determines if the server is accepting requests.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Requests the server to stop. The accept loop and all connection loops exit
    /// within their next poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Rebuilds the ring and the per-peer clients for the given membership and binds
    /// this server as peer picker into the given groups.
    ///
    /// The local address is always part of the ring; an empty peer list therefore
    /// degrades to a single-node ring where every key is owned locally.
    pub fn set_peers(self: &Arc<Self>, peers: &[String], groups: &[Arc<Group>]) {
        let mut nodes: Vec<String> = peers.to_vec();
        if !nodes.contains(&self.address) {
            nodes.push(self.address.clone());
        }
        self.ring.add_nodes(&nodes);

        let mut clients = HashMap::with_capacity(peers.len());
        for peer in peers {
            if peer != &self.address {
                let _ = clients.insert(peer.clone(), Arc::new(PeerClient::new(peer)));
            }
        }
        *self.clients.write().unwrap() = clients;

        for group in groups {
            group.register_peers(Some(self.clone() as Arc<dyn PeerPicker>));
        }

        log::info!(
            "Updated the ring of {} to {} node(s)...",
            self.address,
            nodes.len()
        );
    }

    /// Binds the server socket and serves incoming peer connections until
    /// [stop](Server::stop) is called.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(anyhow!("server {} is already running", self.address));
        }

        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("failed to bind server address {}", self.address))?;
        log::info!("Opened peer server socket on {}...", self.address);

        while self.is_running() {
            match tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()).await {
                Ok(Ok((stream, _))) => self.handle_new_connection(stream),
                Ok(Err(error)) => log::error!("Failed to accept a connection: {}", error),
                // The timeout elapsed, all we want is to re-check the running flag...
                Err(_) => {}
            }
        }

        log::info!("Closing peer server socket on {}.", self.address);
        Ok(())
    }

    /// Forks a task which runs the protocol loop for one peer connection.
    fn handle_new_connection(self: &Arc<Self>, stream: TcpStream) {
        let server = self.clone();
        crate::spawn!(async move {
            let _ = stream.set_nodelay(true);
            let peer_address = stream
                .peer_addr()
                .map(|address| address.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            log::debug!("Opened connection from {}...", peer_address);

            if let Err(error) = server.connection_loop(stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", peer_address);
        });
    }

    /// Reads framed requests off the connection and answers each in order.
    async fn connection_loop(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut input = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);

        while self.is_running() {
            // Serve every complete request already sitting in the buffer...
            loop {
                match GetRequest::parse(&input) {
                    Ok(Some((request, consumed))) => {
                        input.advance(consumed);
                        let response = self.dispatch(&request).await;
                        let mut output = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
                        response.encode(&mut output);
                        stream.write_all(&output).await?;
                    }
                    // A partial request - keep reading...
                    Ok(None) => break,
                    Err(error) => {
                        // The connection might be out of sync, so we answer with an
                        // error and close it rather than guessing a frame boundary.
                        let mut output = BytesMut::with_capacity(256);
                        GetResponse::Error(format!("malformed request: {}", error))
                            .encode(&mut output);
                        stream.write_all(&output).await?;
                        return Ok(());
                    }
                }
            }

            match tokio::time::timeout(READ_WAIT_TIMEOUT, stream.read_buf(&mut input)).await {
                // The peer closed the connection...
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    return Err(anyhow!(
                        "an error occurred while reading from the peer: {}",
                        error
                    ));
                }
                // The timeout elapsed, re-evaluate the while condition...
                Err(_) => {}
            }
        }

        Ok(())
    }

    /// Answers one request from the process-wide group registry.
    ///
    /// Errors are returned to the caller verbatim; nothing is cached on behalf of the
    /// requesting peer.
    async fn dispatch(&self, request: &GetRequest) -> GetResponse {
        if !self.is_running() {
            return GetResponse::Error(CacheError::ShuttingDown.to_string());
        }

        let group = match get_group(&request.group) {
            Some(group) => group,
            None => return GetResponse::Error(format!("no such group: {}", request.group)),
        };

        match group.get(&request.key).await {
            Ok(value) => GetResponse::Value(value.as_bytes()),
            Err(error) => GetResponse::Error(error.to_string()),
        }
    }
}

impl PeerPicker for Server {
    /// Returns a client for the peer owning the key, or **None** when the key is owned
    /// locally (which tells the group to use its own loader).
    fn pick(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        if key.is_empty() {
            return None;
        }

        let owner = self.ring.pick(key)?;
        if owner == self.address {
            return None;
        }

        let clients = self.clients.read().unwrap();
        clients
            .get(&owner)
            .map(|client| client.clone() as Arc<dyn PeerGetter>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::new_group;
    use crate::testing::{test_async, SHARED_TEST_RESOURCES};
    use std::sync::atomic::AtomicUsize;

    /// Forks the server loop and waits until the socket accepts connections.
    async fn start_server(server: &Arc<Server>) {
        let forked = server.clone();
        crate::spawn!(async move {
            if let Err(error) = forked.run().await {
                panic!("server failed to start: {}", error);
            }
        });

        for _ in 0..100 {
            if TcpStream::connect(server.address()).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server {} did not come up", server.address());
    }

    #[test]
    fn values_are_served_over_the_wire() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let counter = invocations.clone();
            let group = new_group("wire-scores", 2 << 10, move |key: &str| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                match key {
                    "Tom" => Ok(b"630".to_vec()),
                    _ => Err(CacheError::not_found(key)),
                }
            });

            let server = Arc::new(Server::new("127.0.0.1:25403"));
            start_server(&server).await;

            let client = PeerClient::new("127.0.0.1:25403");
            assert_eq!(
                client.get("wire-scores", "Tom").await.unwrap(),
                b"630".to_vec()
            );

            // The second fetch is answered from the server's cache.
            assert_eq!(
                client.get("wire-scores", "Tom").await.unwrap(),
                b"630".to_vec()
            );
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // Loader errors travel back over the wire verbatim.
            let error = client.get("wire-scores", "Tam").await.unwrap_err();
            assert!(error.to_string().contains("not found"));

            // An unknown group is an error, not a silent miss.
            let error = client.get("no-such-group", "Tom").await.unwrap_err();
            assert!(error.to_string().contains("no such group"));

            server.stop();
            group.stop();
        });
    }

    #[test]
    fn the_ring_splits_keys_between_the_peers() {
        test_async(async {
            let group = new_group("routing-scores", 2 << 10, |_key: &str| {
                Ok(b"irrelevant".to_vec())
            });

            let server = Arc::new(Server::new("127.0.0.1:25404"));
            server.set_peers(
                &["127.0.0.1:25404".to_owned(), "127.0.0.1:25405".to_owned()],
                &[group.clone()],
            );

            let mut local = 0;
            let mut remote = 0;
            for index in 0..256 {
                match server.pick(&format!("key-{}", index)) {
                    None => local += 1,
                    Some(_) => remote += 1,
                }
            }

            // With 50 virtual nodes per peer, both sides of the ring see traffic.
            assert!(local > 0, "no key was owned locally");
            assert!(remote > 0, "no key was routed to the remote peer");

            group.stop();
        });
    }

    #[test]
    fn an_empty_peer_list_owns_every_key() {
        test_async(async {
            let server = Arc::new(Server::new("127.0.0.1:25406"));
            server.set_peers(&[], &[]);

            for index in 0..64 {
                assert!(server.pick(&format!("key-{}", index)).is_none());
            }
            assert!(server.pick("").is_none());
        });
    }

    #[test]
    fn stopping_ends_the_accept_loop() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let server = Arc::new(Server::new("127.0.0.1:25407"));
            let forked = server.clone();
            let handle = tokio::spawn(async move { forked.run().await });

            for _ in 0..100 {
                if TcpStream::connect("127.0.0.1:25407").await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            server.stop();
            let result = tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("the accept loop did not exit")
                .unwrap();
            assert!(result.is_ok());
        });
    }

    #[test]
    fn a_second_run_is_rejected() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let server = Arc::new(Server::new("127.0.0.1:25408"));
            start_server(&server).await;

            let error = server.run().await.unwrap_err();
            assert!(error.to_string().contains("already running"));

            server.stop();
        });
    }
}
