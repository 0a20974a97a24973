//! Peer-to-peer networking: framed TCP connections, a registry of connected peers,
//! and deduplicated relay of blocks and transactions.

pub mod message;
pub mod peer;
pub mod seen;

pub use message::*;
pub use peer::*;
pub use seen::*;

use crate::crypto::Sha256Hash;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Hashes remembered node-wide to suppress re-processing of relayed objects.
pub const SEEN_INVENTORY_SIZE: usize = 20_000;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected peers plus the node-wide seen-set.
#[derive(Debug)]
pub struct Network {
    peers: RwLock<HashMap<SocketAddr, PeerHandle>>,
    seen: Mutex<SeenSet>,
    max_peers: usize,
}

impl Network {
    pub fn new(max_peers: usize) -> Self {
        Network {
            peers: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenSet::new(SEEN_INVENTORY_SIZE)),
            max_peers,
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peers(&self) -> Vec<PeerHandle> {
        self.peers.read().values().cloned().collect()
    }

    /// True if a connection exists whose socket or advertised listen address is `address`.
    pub fn is_connected_to(&self, address: &SocketAddr) -> bool {
        self.peers
            .read()
            .values()
            .any(|p| &p.address == address || p.listen_address().as_ref() == Some(address))
    }

    /// Listen addresses of handshaked peers, excluding the connection `except`.
    pub fn listen_addresses(&self, except: Option<&SocketAddr>) -> Vec<SocketAddr> {
        self.peers
            .read()
            .values()
            .filter(|p| Some(&p.address) != except)
            .filter_map(PeerHandle::listen_address)
            .collect()
    }

    /// Records `hash` in the seen-set. Returns `false` if it was already seen.
    pub fn mark_seen(&self, hash: Sha256Hash) -> bool {
        self.seen.lock().insert(hash)
    }

    pub fn has_seen(&self, hash: &Sha256Hash) -> bool {
        self.seen.lock().contains(hash)
    }

    /// Relays `message` to every handshaked peer except `except`. Returns the number
    /// of peers it was queued for.
    pub fn broadcast(&self, message: &Message, except: Option<&SocketAddr>) -> usize {
        self.peers()
            .into_iter()
            .filter(|p| p.is_handshaked() && Some(&p.address) != except)
            .filter(|p| p.relay(message.clone()))
            .count()
    }

    /// Registers a fresh connection and starts its tasks.
    pub fn add_peer<H: MessageHandler>(
        self: &Arc<Self>,
        stream: TcpStream,
        outbound: bool,
        handler: Arc<H>,
    ) -> Result<PeerHandle, PeerError> {
        let connected = self.peer_count();
        if connected >= self.max_peers {
            return Err(PeerError::TooManyPeers(connected));
        }

        let (handle, task) = create_peer(stream, outbound, self.clone(), handler)?;
        self.peers.write().insert(handle.address, handle.clone());
        task.spawn();
        Ok(handle)
    }

    pub fn remove_peer(&self, address: &SocketAddr) -> Option<PeerHandle> {
        self.peers.write().remove(address)
    }

    /// Dials `address` and registers the connection as outbound.
    pub async fn connect<H: MessageHandler>(
        self: &Arc<Self>,
        address: &str,
        handler: Arc<H>,
    ) -> Result<PeerHandle, PeerError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| PeerError::Timeout)??;
        self.add_peer(stream, true, handler)
    }

    pub fn disconnect_all(&self, reason: &str) {
        for peer in self.peers() {
            peer.kill(reason.to_string());
        }
    }
}

/// Accepts inbound connections on `listener` until the task is aborted.
pub fn start_server<H: MessageHandler>(
    listener: TcpListener,
    network: Arc<Network>,
    handler: Arc<H>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, address) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            match network.add_peer(stream, false, handler.clone()) {
                Ok(_) => info!(peer = %address, "inbound peer connected"),
                Err(e) => warn!(peer = %address, error = %e, "rejected inbound peer"),
            }
        }
    })
}
