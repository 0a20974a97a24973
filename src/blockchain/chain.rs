use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use std::collections::HashMap;
use tracing::info;

use super::block::Block;
use super::params::ChainParams;
use super::state::State;
use super::validation::{genesis_block, genesis_state, validate_block, validate_chain};

/// How an incoming block relates to the local chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRelation {
    /// Already part of the local chain.
    Known,
    /// Builds directly on the local tip.
    ExtendsTip,
    /// Higher than our tip but not linked to it: the sender knows a longer chain.
    Ahead,
    /// At or below our height on a different branch. Ignored under longest-chain.
    Stale,
}

/// A chain that passed full validation from genesis together with the state it
/// produces. Only [`ValidatedChain::validate`] can build one, so
/// [`Blockchain::replace_chain`] never sees unchecked blocks.
#[derive(Debug, Clone)]
pub struct ValidatedChain {
    blocks: Vec<Block>,
    state: State,
}

impl ValidatedChain {
    pub fn validate(blocks: Vec<Block>, params: &ChainParams) -> Result<Self, ChainError> {
        let state = validate_chain(&blocks, params)?;
        Ok(ValidatedChain { blocks, state })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn tip_hash(&self) -> Option<Sha256Hash> {
        self.blocks.last().map(Block::hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSummary {
    pub height: u64,
    pub tip_hash: Sha256Hash,
    pub genesis_hash: Sha256Hash,
    pub difficulty: u32,
    pub transfer_count: usize,
    pub account_count: usize,
    pub total_supply: u128,
}

#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    state: State,
    params: ChainParams,
    index_by_hash: HashMap<Sha256Hash, u64>,
}

impl Blockchain {
    /// Creates a chain holding only the genesis block derived from `params`.
    pub fn new(params: ChainParams) -> Result<Self, ChainError> {
        let genesis = genesis_block(&params);
        let state = genesis_state(&params)?;
        let mut index_by_hash = HashMap::new();
        index_by_hash.insert(genesis.hash(), 0);

        Ok(Blockchain {
            blocks: vec![genesis],
            state,
            params,
            index_by_hash,
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn block(&self, index: u64) -> Option<&Block> {
        self.blocks.get(index as usize)
    }

    pub fn tip(&self) -> &Block {
        // `blocks` always holds at least the genesis block.
        &self.blocks[self.blocks.len() - 1]
    }

    /// Index of the tip block.
    pub fn height(&self) -> u64 {
        self.tip().index()
    }

    /// Number of blocks, genesis included. This is the fork-choice weight.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn genesis_hash(&self) -> Sha256Hash {
        self.blocks[0].hash()
    }

    pub fn contains_block(&self, hash: &Sha256Hash) -> bool {
        self.index_by_hash.contains_key(hash)
    }

    pub fn get_balance(&self, address: &crate::crypto::Address) -> u64 {
        self.state.get_balance(address)
    }

    pub fn get_nonce(&self, address: &crate::crypto::Address) -> u64 {
        self.state.get_nonce(address)
    }

    pub fn difficulty(&self) -> u32 {
        self.params.difficulty_at(self.height() + 1)
    }

    pub fn classify(&self, block: &Block) -> BlockRelation {
        let hash = block.hash();
        if self.contains_block(&hash) {
            BlockRelation::Known
        } else if block.index() == self.height() + 1 && block.header.previous_hash == self.tip().hash() {
            BlockRelation::ExtendsTip
        } else if block.index() > self.height() {
            BlockRelation::Ahead
        } else {
            BlockRelation::Stale
        }
    }

    /// Validates `block` against the tip and appends it. On error nothing changes.
    pub fn apply_block(&mut self, block: Block) -> Result<(), ChainError> {
        let next_state = validate_block(&block, self.tip(), &self.state, &self.params)?;

        let hash = block.hash();
        info!(
            index = block.index(),
            hash = %hex::encode(hash),
            transactions = block.transactions.len(),
            "block appended"
        );
        self.index_by_hash.insert(hash, block.index());
        self.blocks.push(block);
        self.state = next_state;
        Ok(())
    }

    /// Longest-chain fork choice. Adopts `candidate` only if it is strictly longer;
    /// equal length keeps the current chain. Returns the blocks that were dropped
    /// from the local chain so their transfers can be re-admitted to the mempool.
    pub fn replace_chain(&mut self, candidate: ValidatedChain) -> Result<Vec<Block>, ChainError> {
        if candidate.len() <= self.blocks.len() {
            return Err(ChainError::StalePeerData(format!(
                "Candidate chain has {} blocks, local chain has {}",
                candidate.len(),
                self.blocks.len()
            )));
        }

        let ValidatedChain { blocks, state } = candidate;

        let fork_point = self
            .blocks
            .iter()
            .zip(blocks.iter())
            .take_while(|(ours, theirs)| ours.hash() == theirs.hash())
            .count();
        let abandoned = self.blocks.split_off(fork_point);

        info!(
            old_len = fork_point + abandoned.len(),
            new_len = blocks.len(),
            fork_point,
            abandoned = abandoned.len(),
            "chain replaced"
        );

        self.index_by_hash = blocks
            .iter()
            .map(|b| (b.hash(), b.index()))
            .collect();
        self.blocks = blocks;
        self.state = state;
        Ok(abandoned)
    }

    /// Recomputes the state by replaying every block from genesis.
    pub fn replay_state(&self) -> Result<State, ChainError> {
        validate_chain(&self.blocks, &self.params)
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            height: self.height(),
            tip_hash: self.tip().hash(),
            genesis_hash: self.genesis_hash(),
            difficulty: self.difficulty(),
            transfer_count: self.blocks.iter().map(|b| b.transfers().count()).sum(),
            account_count: self.state.account_count(),
            total_supply: self.state.total_supply(),
        }
    }
}
