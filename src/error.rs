//! Error types for MiniChain

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    MalformedData(String),
    InvalidSignature(String),
    InvalidTransaction(String),
    InvalidBlock(String),
    InvalidChain(String),
    /// A peer offered a chain that is not longer than ours. Ignored, not fatal.
    StalePeerData(String),
    PeerIo(String),
    /// Mempool admission refused.
    Rejected(String),
    MiningCancelled,
    CryptoError(String),
    ConfigError(String),
    IoError(String),
    BincodeError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::MalformedData(msg) => write!(f, "Malformed data: {}", msg),
            ChainError::InvalidSignature(msg) => write!(f, "Invalid signature: {}", msg),
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::InvalidChain(msg) => write!(f, "Invalid chain: {}", msg),
            ChainError::StalePeerData(msg) => write!(f, "Stale peer data: {}", msg),
            ChainError::PeerIo(msg) => write!(f, "Peer I/O error: {}", msg),
            ChainError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            ChainError::MiningCancelled => write!(f, "Mining cancelled"),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::BincodeError(msg) => write!(f, "Bincode error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl ChainError {
    /// Validation failures are expected from adversarial input and never take the node down.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            ChainError::MalformedData(_)
                | ChainError::InvalidSignature(_)
                | ChainError::InvalidTransaction(_)
                | ChainError::InvalidBlock(_)
                | ChainError::InvalidChain(_)
                | ChainError::StalePeerData(_)
                | ChainError::Rejected(_)
        )
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<secp256k1::Error> for ChainError {
    fn from(err: secp256k1::Error) -> Self {
        ChainError::CryptoError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
