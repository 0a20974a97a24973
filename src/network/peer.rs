//! A single peer connection: one reader task, one writer task.
//!
//! The reader decodes frames and hands each message to a [`MessageHandler`]; the
//! writer drains a bounded queue. Either side failing, or a kill signal, tears the
//! whole connection down and unregisters the peer.

use super::message::{Message, MAX_FRAME_SIZE};
use super::seen::SeenSet;
use super::Network;
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Frames queued for one peer before it is considered too slow and dropped.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Inventory hashes remembered per peer.
pub const KNOWN_INVENTORY_SIZE: usize = 4_096;

/// Time allowed for the first message, which must be `Hello`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for peer")]
    Timeout,

    #[error("Frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("Message decoding error: {0}")]
    MessageDecode(String),

    #[error("Message encoding error: {0}")]
    MessageEncode(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Failed to send to peer: {0}")]
    SendError(String),

    #[error("Peer killed: {0}")]
    Killed(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Too many peers ({0} connected)")]
    TooManyPeers(usize),
}

impl From<PeerError> for ChainError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::FrameTooLarge(_) | PeerError::MessageDecode(_) => {
                ChainError::MalformedData(err.to_string())
            }
            other => ChainError::PeerIo(other.to_string()),
        }
    }
}

/// Receives every message a peer sends. Returning an error closes that peer.
pub trait MessageHandler: Send + Sync + 'static {
    /// Called once the peer is registered, before any message is read.
    fn on_connect(self: Arc<Self>, peer: PeerHandle) -> BoxFuture<'static, Result<(), PeerError>>;

    fn on_message(
        self: Arc<Self>,
        peer: PeerHandle,
        message: Message,
    ) -> BoxFuture<'static, Result<(), PeerError>>;

    fn on_disconnect(&self, peer: &PeerHandle, reason: &PeerError);
}

/// Used to reference, message and kill a connected peer.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub address: SocketAddr,
    pub outbound: bool,
    send: mpsc::Sender<Message>,
    known: Arc<Mutex<SeenSet>>,
    listen_address: Arc<Mutex<Option<SocketAddr>>>,
    handshaked: Arc<AtomicBool>,
    kill: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl PeerHandle {
    /// Address the peer accepts connections on, known after its `Hello`.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        *self.listen_address.lock()
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::Acquire)
    }

    pub fn complete_handshake(&self, listen_port: u16) {
        *self.listen_address.lock() = Some(SocketAddr::new(self.address.ip(), listen_port));
        self.handshaked.store(true, Ordering::Release);
    }

    /// Remembers that the peer already has `hash`, so it is never sent back.
    pub fn mark_known(&self, hash: Sha256Hash) {
        self.known.lock().insert(hash);
    }

    pub fn knows(&self, hash: &Sha256Hash) -> bool {
        self.known.lock().contains(hash)
    }

    /// Queues a message, waiting for room in the outbound queue.
    pub async fn send(&self, message: Message) -> Result<(), PeerError> {
        self.send
            .send(message)
            .await
            .map_err(|e| PeerError::SendError(e.to_string()))
    }

    /// Queues a relayed object unless the peer already knows it. Never waits; a peer
    /// whose queue is full is killed. Returns whether the message was queued.
    pub fn relay(&self, message: Message) -> bool {
        if let Some(hash) = message.inventory_hash() {
            if !self.known.lock().insert(hash) {
                return false;
            }
        }

        match self.send.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.kill("outbound queue full".to_string());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn kill(&self, reason: String) {
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(reason);
        }
    }
}

/// Starts the reader and writer tasks for `stream` and returns the peer's handle.
/// The peer removes itself from `network` when the connection ends.
pub fn create_peer<H: MessageHandler>(
    stream: TcpStream,
    outbound: bool,
    network: Arc<Network>,
    handler: Arc<H>,
) -> Result<(PeerHandle, PeerTask<H>), PeerError> {
    let address = stream.peer_addr()?;
    stream.set_nodelay(true)?;

    let (outgoing_tx, outgoing_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_SIZE);
    let (kill, should_kill) = oneshot::channel::<String>();

    let handle = PeerHandle {
        address,
        outbound,
        send: outgoing_tx,
        known: Arc::new(Mutex::new(SeenSet::new(KNOWN_INVENTORY_SIZE))),
        listen_address: Arc::new(Mutex::new(None)),
        handshaked: Arc::new(AtomicBool::new(false)),
        kill: Arc::new(Mutex::new(Some(kill))),
    };

    let task = PeerTask {
        stream,
        outgoing_rx,
        should_kill,
        handle: handle.clone(),
        network,
        handler,
    };
    Ok((handle, task))
}

/// The not-yet-started I/O half of a peer. Kept separate so the peer can be
/// registered before its first message is processed.
pub struct PeerTask<H: MessageHandler> {
    stream: TcpStream,
    outgoing_rx: mpsc::Receiver<Message>,
    should_kill: oneshot::Receiver<String>,
    handle: PeerHandle,
    network: Arc<Network>,
    handler: Arc<H>,
}

impl<H: MessageHandler> PeerTask<H> {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let PeerTask {
            stream,
            outgoing_rx,
            should_kill,
            handle,
            network,
            handler,
        } = self;
        let (reader, writer) = stream.into_split();

        let result = async {
            handler.clone().on_connect(handle.clone()).await?;
            tokio::select! {
                res = reader_task(reader, handle.clone(), handler.clone()) => res,
                res = writer_task(writer, outgoing_rx) => res,
                res = async move {
                    let reason = should_kill
                        .await
                        .unwrap_or_else(|_| "kill channel closed".to_string());
                    Err(PeerError::Killed(reason))
                } => res,
            }
        }
        .await;

        let reason = match result {
            Ok(()) => PeerError::Disconnected,
            Err(e) => e,
        };
        network.remove_peer(&handle.address);
        match reason {
            PeerError::Disconnected => debug!(peer = %handle.address, "peer disconnected"),
            ref e => info!(peer = %handle.address, error = %e, "peer dropped"),
        }
        handler.on_disconnect(&handle, &reason);
    }
}

async fn reader_task<H: MessageHandler>(
    mut reader: OwnedReadHalf,
    handle: PeerHandle,
    handler: Arc<H>,
) -> Result<(), PeerError> {
    let first = timeout(HANDSHAKE_TIMEOUT, Message::read_from(&mut reader))
        .await
        .map_err(|_| PeerError::Handshake("no hello received".to_string()))??;
    if !matches!(first, Message::Hello(_)) {
        return Err(PeerError::Handshake(format!(
            "expected hello, got {}",
            first.kind()
        )));
    }
    handler.clone().on_message(handle.clone(), first).await?;

    loop {
        let message = Message::read_from(&mut reader).await?;
        if let Some(hash) = message.inventory_hash() {
            handle.mark_known(hash);
        }
        handler.clone().on_message(handle.clone(), message).await?;
    }
}

async fn writer_task(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Message>,
) -> Result<(), PeerError> {
    while let Some(message) = receiver.recv().await {
        message.write_to(&mut writer).await?;
    }
    Err(PeerError::Disconnected)
}
