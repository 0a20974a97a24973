//! Proof-of-work mining.
//!
//! The nonce search is the only unbounded CPU loop in the node. It polls a shared
//! cancellation flag and gives up without side effects as soon as the flag is set,
//! so a candidate built on a superseded tip is never published.

use crate::blockchain::{Block, ChainParams};
use crate::crypto::Address;
use crate::error::ChainError;
use crate::transaction::{CoinbaseTx, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::debug;

/// Nonces tried between two looks at the cancellation flag.
pub const CANCEL_CHECK_INTERVAL: u64 = 1_024;

/// Builds an unsolved candidate: the reward coinbase followed by `transactions`.
pub fn build_template(
    previous: &Block,
    transactions: Vec<Transaction>,
    miner: Address,
    params: &ChainParams,
) -> Block {
    let index = previous.index() + 1;
    let coinbase = Transaction::Coinbase(CoinbaseTx::new(miner, params.reward_at(index), index));

    let mut all_txs = Vec::with_capacity(transactions.len() + 1);
    all_txs.push(coinbase);
    all_txs.extend(transactions);

    let mut block = Block::new(index, previous.hash(), miner, params.difficulty_at(index), all_txs);
    // Keep timestamps monotone even if the local clock is behind the previous miner's.
    block.header.timestamp = block.header.timestamp.max(previous.header.timestamp);
    block
}

/// Searches nonces 0, 1, 2, … until the header hash meets its difficulty.
pub fn solve(mut block: Block, cancel: &AtomicBool) -> Result<Block, ChainError> {
    let started = Instant::now();
    let mut attempts: u64 = 0;

    loop {
        if attempts % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            debug!(index = block.index(), attempts, "mining cancelled");
            return Err(ChainError::MiningCancelled);
        }

        if block.has_valid_proof() {
            debug!(
                index = block.index(),
                nonce = block.header.nonce,
                attempts,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "proof found"
            );
            return Ok(block);
        }

        attempts += 1;
        match block.header.nonce.checked_add(1) {
            Some(nonce) => block.header.nonce = nonce,
            None => {
                // Nonce space exhausted: move the timestamp and start over.
                block.header.timestamp += 1;
                block.header.nonce = 0;
            }
        }
    }
}

/// Mines a block on top of `previous` containing `transactions` plus the reward.
pub fn mine_block(
    previous: &Block,
    transactions: Vec<Transaction>,
    miner: Address,
    params: &ChainParams,
    cancel: &AtomicBool,
) -> Result<Block, ChainError> {
    solve(build_template(previous, transactions, miner, params), cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{genesis_block, leading_zero_bits};

    #[test]
    fn test_mined_block_meets_difficulty() {
        let params = ChainParams::new([9u8; 32]).with_difficulty(10);
        let genesis = genesis_block(&params);
        let block = mine_block(&genesis, vec![], [1u8; 32], &params, &AtomicBool::new(false)).unwrap();

        assert!(leading_zero_bits(&block.hash()) >= 10);
        assert_eq!(block.index(), 1);
        assert_eq!(block.header.previous_hash, genesis.hash());
        assert_eq!(block.coinbase().unwrap().amount, params.mining_reward);
    }

    #[test]
    fn test_cancelled_search_returns_nothing() {
        let params = ChainParams::new([9u8; 32]).with_difficulty(64);
        let genesis = genesis_block(&params);
        let cancel = AtomicBool::new(true);
        let result = mine_block(&genesis, vec![], [1u8; 32], &params, &cancel);
        assert_eq!(result.unwrap_err(), ChainError::MiningCancelled);
    }

    #[test]
    fn test_template_timestamp_not_before_previous() {
        let params = ChainParams::new([9u8; 32]);
        let mut previous = genesis_block(&params);
        previous.header.timestamp = u64::MAX / 2;
        let template = build_template(&previous, vec![], [1u8; 32], &params);
        assert!(template.header.timestamp >= previous.header.timestamp);
    }
}
