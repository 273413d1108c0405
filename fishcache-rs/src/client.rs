//! The client side of the peer transport.
//!
//! A [PeerClient] fetches cached values from one specific remote node. Connections are
//! short lived: each request dials the peer, sends one frame and reads one frame. The
//! whole exchange (including the dial) runs under a single deadline; any failure is
//! reported as [CacheError::PeerUnavailable], upon which the group falls back to its
//! local loader.
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::CacheError;
use crate::group::PeerGetter;
use crate::wire::{GetRequest, GetResponse};

/// Deadline applied to one complete request/response exchange.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Pre-allocated receive buffer; most cached values fit without growing it.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Fetches values from a single remote peer.
pub struct PeerClient {
    address: String,
}

impl PeerClient {
    /// Creates a client for the peer reachable under the given address.
    pub fn new(address: &str) -> Self {
        PeerClient {
            address: address.to_owned(),
        }
    }

    /// Returns the address this client talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Performs the actual exchange without any deadline handling.
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.address).await?;

        let mut output = BytesMut::with_capacity(256);
        GetRequest {
            group: group.to_owned(),
            key: key.to_owned(),
        }
        .encode(&mut output);
        stream.write_all(&output).await?;

        let mut input = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        loop {
            if let Some((response, _)) = GetResponse::parse(&input)? {
                return match response {
                    GetResponse::Value(bytes) => Ok(bytes),
                    GetResponse::Error(message) => Err(anyhow!("{}", message)),
                };
            }

            if stream.read_buf(&mut input).await? == 0 {
                return Err(anyhow!("connection closed before a full response arrived"));
            }
        }
    }
}

#[async_trait]
impl PeerGetter for PeerClient {
    async fn get(&self, group: &str, key: &str) -> Result<Vec<u8>, CacheError> {
        match tokio::time::timeout(DEFAULT_RPC_TIMEOUT, self.fetch(group, key)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(error)) => Err(CacheError::PeerUnavailable(format!(
                "could not get {}/{} from peer {}: {}",
                group, key, self.address, error
            ))),
            Err(_) => Err(CacheError::PeerUnavailable(format!(
                "request to peer {} timed out after {:?}",
                self.address, DEFAULT_RPC_TIMEOUT
            ))),
        }
    }
}
