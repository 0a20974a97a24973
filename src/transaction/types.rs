/// Transaction types for MiniChain
use crate::crypto::{Address, KeyPair, Sha256Hash};
use crate::error::ChainError;
use sha2::{Digest, Sha256};

/// Maximum transaction size in bytes to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 4_096;

/// Domain separator for transfer signatures.
pub const TRANSFER_DOMAIN: &[u8] = b"MINICHAIN_TRANSFER:";

/// A transaction that can occur in a block
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Transaction {
    Transfer(TransferTx),
    Coinbase(CoinbaseTx),
}

impl Transaction {
    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let size = bincode::serialized_size(self)
            .map_err(|e| ChainError::MalformedData(format!("Serialization failed: {}", e)))?;

        if size as usize > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                size, MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    /// Calculate the hash of this transaction. For transfers it covers the public key
    /// and signature too, so a copy with a forged signature never shares the id of
    /// the genuine transfer. Replays of the same payload are caught by nonce instead.
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        match self {
            Transaction::Coinbase(tx) => {
                hasher.update(b"coinbase");
                hasher.update(tx.beneficiary);
                hasher.update(tx.amount.to_le_bytes());
                hasher.update(tx.height.to_le_bytes());
            }
            Transaction::Transfer(tx) => {
                hasher.update(b"transfer");
                hasher.update(tx.signable_message());
                hasher.update((tx.public_key.len() as u32).to_le_bytes());
                hasher.update(&tx.public_key);
                hasher.update((tx.signature.len() as u32).to_le_bytes());
                hasher.update(&tx.signature);
            }
        };
        hasher.finalize().into()
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase(_))
    }

    pub fn as_transfer(&self) -> Option<&TransferTx> {
        match self {
            Transaction::Transfer(tx) => Some(tx),
            Transaction::Coinbase(_) => None,
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            Transaction::Transfer(tx) => tx.amount,
            Transaction::Coinbase(tx) => tx.amount,
        }
    }
}

/// Coinbase transaction: consensus-level issuance (mining reward or genesis treasury).
/// Carries no signature; block validation decides whether it is allowed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CoinbaseTx {
    pub beneficiary: Address,
    pub amount: u64,
    /// Height of the block that issues it; keeps reward ids unique.
    pub height: u64,
}

impl CoinbaseTx {
    pub fn new(beneficiary: Address, amount: u64, height: u64) -> Self {
        CoinbaseTx {
            beneficiary,
            amount,
            height,
        }
    }
}

/// Transfer transaction: moves `amount` from `sender` to `recipient`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferTx {
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    /// Must equal the sender's on-chain nonce + 1 when applied.
    pub nonce: u64,
    /// Compressed secp256k1 public key; its hash must equal `sender`.
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl TransferTx {
    /// Builds an unsigned transfer. Use [`TransferTx::create`] for the signed form.
    pub fn new(sender: Address, recipient: Address, amount: u64, nonce: u64) -> Self {
        TransferTx {
            sender,
            recipient,
            amount,
            nonce,
            public_key: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Creates a transfer from the owner of `keypair` and signs it.
    pub fn create(
        keypair: &KeyPair,
        recipient: Address,
        amount: u64,
        nonce: u64,
    ) -> Result<Self, ChainError> {
        let mut tx = TransferTx::new(keypair.address(), recipient, amount, nonce);
        tx.sign_with(keypair)?;
        Ok(tx)
    }

    /// Canonical signing input. Every field is fixed width, so there is exactly one
    /// encoding for a given transfer.
    pub fn signable_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(TRANSFER_DOMAIN.len() + 32 + 32 + 8 + 8);
        message.extend_from_slice(TRANSFER_DOMAIN);
        message.extend_from_slice(&self.sender);
        message.extend_from_slice(&self.recipient);
        message.extend_from_slice(&self.amount.to_le_bytes());
        message.extend_from_slice(&self.nonce.to_le_bytes());
        message
    }

    pub fn sign(&mut self, signature: Vec<u8>, public_key: Vec<u8>) {
        self.signature = signature;
        self.public_key = public_key;
    }

    pub fn sign_with(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        if keypair.address() != self.sender {
            return Err(ChainError::CryptoError(
                "Signing key does not match sender".to_string(),
            ));
        }
        let signature = keypair.sign(&self.signable_message())?;
        self.sign(signature.to_vec(), keypair.public_key_bytes().to_vec());
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty() && !self.public_key.is_empty()
    }
}

impl From<TransferTx> for Transaction {
    fn from(tx: TransferTx) -> Self {
        Transaction::Transfer(tx)
    }
}

impl From<CoinbaseTx> for Transaction {
    fn from(tx: CoinbaseTx) -> Self {
        Transaction::Coinbase(tx)
    }
}
