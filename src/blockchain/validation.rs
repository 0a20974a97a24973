use crate::crypto::{Sha256Hash, ZERO_HASH};
use crate::error::ChainError;
use crate::transaction::{CoinbaseTx, Transaction};
use std::collections::HashSet;

use super::block::Block;
use super::params::ChainParams;
use super::state::State;

/// Blocks stamped further than this into the future are rejected.
pub const MAX_FUTURE_DRIFT_MS: u64 = 2 * 60 * 60 * 1000;

/// The single genesis block every node derives from the shared chain parameters.
/// It is exempt from proof-of-work and identified by its exact hash.
pub fn genesis_block(params: &ChainParams) -> Block {
    let treasury = Transaction::Coinbase(CoinbaseTx::new(
        params.treasury_address,
        params.treasury_balance,
        0,
    ));
    Block::with_timestamp(
        0,
        ZERO_HASH,
        params.genesis_timestamp,
        params.treasury_address,
        0,
        vec![treasury],
    )
}

pub fn genesis_state(params: &ChainParams) -> Result<State, ChainError> {
    let mut state = State::new();
    if params.treasury_balance > 0 {
        state.apply_block_reward(params.treasury_address, params.treasury_balance)?;
    }
    Ok(state)
}

pub fn validate_no_duplicates(block: &Block) -> Result<(), ChainError> {
    let mut seen: HashSet<Sha256Hash> = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !seen.insert(tx.hash()) {
            return Err(ChainError::InvalidBlock(format!(
                "Transaction {} appears twice in block {}",
                tx.hash_str(),
                block.index()
            )));
        }
    }
    Ok(())
}

/// Header-level checks: linkage, timestamp, difficulty, proof-of-work and the
/// transaction digest. Needs no state.
pub fn validate_header(
    block: &Block,
    previous: &Block,
    params: &ChainParams,
) -> Result<(), ChainError> {
    let header = &block.header;

    if header.index != previous.index() + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid block index. Expected {}, but got {}.",
            previous.index() + 1,
            header.index
        )));
    }

    let previous_hash = previous.hash();
    if header.previous_hash != previous_hash {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid previous block hash. Expected {}, but got {}.",
            hex::encode(previous_hash),
            hex::encode(header.previous_hash)
        )));
    }

    let now = chrono::Utc::now().timestamp_millis() as u64;
    if header.timestamp > now.saturating_add(MAX_FUTURE_DRIFT_MS) {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} timestamp {} is too far in the future",
            header.index, header.timestamp
        )));
    }

    let expected_difficulty = params.difficulty_at(header.index);
    if header.difficulty != expected_difficulty {
        return Err(ChainError::InvalidBlock(format!(
            "Invalid difficulty. Expected {}, but got {}.",
            expected_difficulty, header.difficulty
        )));
    }

    let expected_digest = Block::calculate_transactions_digest(&block.transactions);
    if expected_digest != header.transactions_digest {
        return Err(ChainError::InvalidBlock(format!(
            "Transactions digest mismatch. Expected {}, but got {}.",
            hex::encode(expected_digest),
            hex::encode(header.transactions_digest)
        )));
    }

    if !block.has_valid_proof() {
        return Err(ChainError::InvalidBlock(
            "Invalid Proof-of-Work: Block hash does not meet difficulty target.".to_string(),
        ));
    }

    Ok(())
}

/// Checks the transaction list of a non-genesis block and replays it on a copy of
/// `state`, returning the post-block state.
pub fn validate_block_transactions(
    block: &Block,
    state: &State,
    params: &ChainParams,
) -> Result<State, ChainError> {
    let index = block.index();
    let transfers = block.transactions.len().saturating_sub(1);
    if transfers > params.max_transactions_per_block {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} carries {} transactions (max: {})",
            index, transfers, params.max_transactions_per_block
        )));
    }

    validate_no_duplicates(block)?;

    let mut next = state.clone();
    for (i, tx) in block.transactions.iter().enumerate() {
        match tx {
            Transaction::Coinbase(cb) => {
                if i != 0 {
                    return Err(ChainError::InvalidBlock(format!(
                        "Coinbase at position {} in block {}; only the first transaction may issue coins",
                        i, index
                    )));
                }
                cb.verify()?;
                let expected_reward = params.reward_at(index);
                if cb.amount != expected_reward {
                    return Err(ChainError::InvalidBlock(format!(
                        "Coinbase pays {} but the block reward is {}",
                        cb.amount, expected_reward
                    )));
                }
                if cb.beneficiary != block.header.miner {
                    return Err(ChainError::InvalidBlock(
                        "Coinbase beneficiary does not match block miner".to_string(),
                    ));
                }
                if cb.height != index {
                    return Err(ChainError::InvalidBlock(format!(
                        "Coinbase height {} does not match block index {}",
                        cb.height, index
                    )));
                }
            }
            Transaction::Transfer(_) => {
                if i == 0 {
                    return Err(ChainError::InvalidBlock(
                        "First transaction in a block must be a Coinbase transaction.".to_string(),
                    ));
                }
                tx.verify()
                    .map_err(|e| ChainError::InvalidBlock(format!("Transaction {}: {}", tx.hash_str(), e)))?;
            }
        }
        next.apply_transaction(tx)
            .map_err(|e| ChainError::InvalidBlock(format!("Block {} replay failed: {}", index, e)))?;
    }

    if block.transactions.is_empty() {
        return Err(ChainError::InvalidBlock(format!(
            "Block {} has no coinbase",
            index
        )));
    }

    Ok(next)
}

/// Full validation of `block` on top of `previous`, whose post-state is `state`.
/// Returns the state after the block; `state` itself is never modified.
pub fn validate_block(
    block: &Block,
    previous: &Block,
    state: &State,
    params: &ChainParams,
) -> Result<State, ChainError> {
    validate_header(block, previous, params)?;
    validate_block_transactions(block, state, params)
}

/// Validates a whole chain from genesis and returns the state it produces.
pub fn validate_chain(blocks: &[Block], params: &ChainParams) -> Result<State, ChainError> {
    let genesis = blocks
        .first()
        .ok_or_else(|| ChainError::InvalidChain("Chain is empty".to_string()))?;

    let expected_genesis = genesis_block(params);
    if genesis.hash() != expected_genesis.hash() || *genesis != expected_genesis {
        return Err(ChainError::InvalidChain(format!(
            "Genesis mismatch: expected {}, got {}",
            hex::encode(expected_genesis.hash()),
            hex::encode(genesis.hash())
        )));
    }

    let mut state = genesis_state(params)?;
    for pair in blocks.windows(2) {
        let (previous, block) = (&pair[0], &pair[1]);
        state = validate_block(block, previous, &state, params).map_err(|e| {
            ChainError::InvalidChain(format!("Block {} rejected: {}", block.index(), e))
        })?;
    }
    Ok(state)
}
