use crate::crypto::Address;

/// Fixed genesis timestamp (2024-01-01T00:00:00Z, milliseconds).
pub const GENESIS_TIMESTAMP: u64 = 1_704_067_200_000;

pub const DEFAULT_DIFFICULTY: u32 = 16;
pub const DEFAULT_MINING_REWARD: u64 = 50;
pub const DEFAULT_MAX_TRANSACTIONS_PER_BLOCK: usize = 100;
pub const DEFAULT_TREASURY_BALANCE: u64 = 10_000_000;

/// Well-known development key that owns the genesis treasury. Never use on a real network.
pub const DEV_TREASURY_SECRET_KEY: &str =
    "4d696e69436861696e20646576207472656173757279206b6579202d20763031";

/// Consensus-critical parameters. Every node on a network must use identical values,
/// since they determine the genesis hash and block validity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChainParams {
    /// Leading zero bits required of every non-genesis block hash. Constant per network.
    pub difficulty: u32,
    pub mining_reward: u64,
    /// Transfers per block, not counting the coinbase.
    pub max_transactions_per_block: usize,
    pub treasury_address: Address,
    pub treasury_balance: u64,
    pub genesis_timestamp: u64,
}

impl ChainParams {
    pub fn new(treasury_address: Address) -> Self {
        ChainParams {
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: DEFAULT_MINING_REWARD,
            max_transactions_per_block: DEFAULT_MAX_TRANSACTIONS_PER_BLOCK,
            treasury_address,
            treasury_balance: DEFAULT_TREASURY_BALANCE,
            genesis_timestamp: GENESIS_TIMESTAMP,
        }
    }

    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_treasury_balance(mut self, balance: u64) -> Self {
        self.treasury_balance = balance;
        self
    }

    pub fn with_mining_reward(mut self, reward: u64) -> Self {
        self.mining_reward = reward;
        self
    }

    /// Difficulty required of the block at `index`. Kept constant; a retarget rule would
    /// go here and must stay a pure function of the chain.
    pub fn difficulty_at(&self, _index: u64) -> u32 {
        self.difficulty
    }

    pub fn reward_at(&self, _index: u64) -> u64 {
        self.mining_reward
    }
}
