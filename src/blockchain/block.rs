use crate::crypto::{Address, Sha256Hash};
use crate::transaction::{CoinbaseTx, Transaction};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub index: u64,
    pub previous_hash: Sha256Hash,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub transactions_digest: Sha256Hash,
    pub miner: Address,
    /// Required leading zero bits of the block hash.
    pub difficulty: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.transactions_digest);
        hasher.update(self.miner);
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

/// The block hash is never stored: it is recomputed from the header wherever it is
/// needed, so a tampered field can't hide behind a stale hash.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(
        index: u64,
        previous_hash: Sha256Hash,
        miner: Address,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        Self::with_timestamp(index, previous_hash, timestamp, miner, difficulty, transactions)
    }

    pub fn with_timestamp(
        index: u64,
        previous_hash: Sha256Hash,
        timestamp: u64,
        miner: Address,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        let transactions_digest = Block::calculate_transactions_digest(&transactions);
        Block {
            header: BlockHeader {
                index,
                previous_hash,
                timestamp,
                transactions_digest,
                miner,
                difficulty,
                nonce: 0,
            },
            transactions,
        }
    }

    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    /// Flat SHA-256 over the transaction hashes in block order.
    pub fn calculate_transactions_digest(transactions: &[Transaction]) -> Sha256Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.hash());
        }
        hasher.finalize().into()
    }

    pub fn coinbase(&self) -> Option<&CoinbaseTx> {
        match self.transactions.first() {
            Some(Transaction::Coinbase(cb)) => Some(cb),
            _ => None,
        }
    }

    /// Transfers only, i.e. everything the mempool could have supplied.
    pub fn transfers(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| !tx.is_coinbase())
    }

    pub fn hash_to_target(difficulty: u32) -> Sha256Hash {
        let mut target = [0xFF; 32];
        let leading_zeros = (difficulty / 8).min(32);
        let partial_bits = difficulty % 8;

        for item in target.iter_mut().take(leading_zeros as usize) {
            *item = 0;
        }

        if leading_zeros < 32 && partial_bits > 0 {
            target[leading_zeros as usize] = 0xFF >> partial_bits;
        }
        target
    }

    /// Big-endian comparison of the hash against the difficulty target.
    pub fn meets_difficulty(hash: &Sha256Hash, difficulty: u32) -> bool {
        *hash <= Block::hash_to_target(difficulty)
    }

    pub fn has_valid_proof(&self) -> bool {
        Block::meets_difficulty(&self.hash(), self.header.difficulty)
    }
}

pub fn leading_zero_bits(hash: &Sha256Hash) -> u32 {
    let mut bits = 0;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
