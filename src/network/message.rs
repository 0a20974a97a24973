//! Wire protocol: a tagged message enum carried in length-prefixed frames.
//!
//! ```text
//! [length: u32 BE][bincode(Message)]
//! ```

use super::peer::PeerError;
use crate::blockchain::Block;
use crate::crypto::Sha256Hash;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame body. A full chain travels in a single frame.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Time allowed for a frame body to arrive once its length has been read.
pub const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub network_id: String,
    pub genesis_hash: Sha256Hash,
    pub height: u64,
    /// Port the sender accepts connections on, so others can dial it back.
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello(Hello),
    NewTransaction(Transaction),
    NewBlock(Block),
    GetChain,
    Chain(Vec<Block>),
    GetPeers,
    Peers(Vec<SocketAddr>),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::NewTransaction(_) => "new_transaction",
            Message::NewBlock(_) => "new_block",
            Message::GetChain => "get_chain",
            Message::Chain(_) => "chain",
            Message::GetPeers => "get_peers",
            Message::Peers(_) => "peers",
        }
    }

    /// Hash of the relayed object, for messages subject to deduplication.
    pub fn inventory_hash(&self) -> Option<Sha256Hash> {
        match self {
            Message::NewTransaction(tx) => Some(tx.hash()),
            Message::NewBlock(block) => Some(block.hash()),
            _ => None,
        }
    }

    /// Encodes the message as a complete frame, length prefix included.
    pub fn to_frame(&self) -> Result<Vec<u8>, PeerError> {
        let body = bincode::serialize(self).map_err(|e| PeerError::MessageEncode(e.to_string()))?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(PeerError::FrameTooLarge(body.len()));
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, PeerError> {
        bincode::deserialize(body).map_err(|e| PeerError::MessageDecode(e.to_string()))
    }

    /// Waits for the next frame. Idle time before the length prefix is unbounded;
    /// the body must follow within [`FRAME_READ_TIMEOUT`].
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, PeerError>
    where
        R: AsyncRead + Unpin,
    {
        let length = match reader.read_u32().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(PeerError::Disconnected)
            }
            Err(e) => return Err(e.into()),
        };
        if length > MAX_FRAME_SIZE {
            return Err(PeerError::FrameTooLarge(length));
        }

        let mut body = vec![0u8; length];
        timeout(FRAME_READ_TIMEOUT, reader.read_exact(&mut body))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Self::from_bytes(&body)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), PeerError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.to_frame()?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{genesis_block, ChainParams};
    use crate::crypto::KeyPair;
    use crate::transaction::TransferTx;

    #[tokio::test]
    async fn test_frames_survive_a_stream() {
        let keypair = KeyPair::generate();
        let tx: Transaction = TransferTx::create(&keypair, [7u8; 32], 5, 1).unwrap().into();
        let genesis = genesis_block(&ChainParams::new(keypair.address()));

        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let sent = vec![
            Message::NewTransaction(tx),
            Message::Chain(vec![genesis]),
            Message::GetPeers,
        ];
        for message in &sent {
            message.write_to(&mut client).await.unwrap();
        }

        for expected in &sent {
            let received = Message::read_from(&mut server).await.unwrap();
            assert_eq!(&received, expected);
        }
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = Message::read_from(&mut server).await.unwrap_err();
        assert!(matches!(err, PeerError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_garbage_body_fails_to_decode() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff]).await.unwrap();

        let err = Message::read_from(&mut server).await.unwrap_err();
        assert!(matches!(err, PeerError::MessageDecode(_)));
    }

    #[tokio::test]
    async fn test_closed_stream_reports_disconnect() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = Message::read_from(&mut server).await.unwrap_err();
        assert!(matches!(err, PeerError::Disconnected));
    }

    #[test]
    fn test_inventory_hash_only_for_relayed_objects() {
        assert!(Message::GetChain.inventory_hash().is_none());
        let genesis = genesis_block(&ChainParams::new([1u8; 32]));
        assert_eq!(
            Message::NewBlock(genesis.clone()).inventory_hash(),
            Some(genesis.hash())
        );
    }
}
