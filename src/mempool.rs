//! Transaction pool for pending transfers awaiting block inclusion.
//!
//! Entries are indexed by hash and by `(sender, nonce)`. Several transfers from one
//! sender may queue with consecutive nonces; block assembly hands them out in an order
//! that replays cleanly against the chain state.

use crate::blockchain::State;
use crate::crypto::{Address, Sha256Hash};
use crate::error::ChainError;
use crate::transaction::{Transaction, TransferTx};
use std::collections::HashMap;

/// Default transaction pool capacity.
pub const MAX_MEMPOOL_SIZE: usize = 10_000;

/// How far beyond the sender's on-chain nonce a queued transfer may reach.
pub const MAX_NONCE_GAP: u64 = 64;

/// Pruning rounds (one per accepted block) a transfer may spend waiting behind a
/// missing nonce before it is evicted.
pub const MAX_STALLED_ROUNDS: u32 = 10;

#[derive(Debug, Clone)]
struct PendingTx {
    tx: TransferTx,
    arrival: u64,
    stalled_rounds: u32,
}

#[derive(Debug, Clone)]
pub struct Mempool {
    transactions: HashMap<Sha256Hash, PendingTx>,
    by_sender_nonce: HashMap<(Address, u64), Sha256Hash>,
    next_arrival: u64,
    capacity: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MEMPOOL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Mempool {
            transactions: HashMap::new(),
            by_sender_nonce: HashMap::new(),
            next_arrival: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.transactions.contains_key(hash)
    }

    /// Admits a transfer after the stateless checks and a plausibility check against
    /// `state`. The nonce need not be next in line, only unused and not too far ahead.
    pub fn add(&mut self, tx: Transaction, state: &State) -> Result<Sha256Hash, ChainError> {
        let hash = tx.hash();
        if self.transactions.contains_key(&hash) {
            return Err(ChainError::Rejected(format!(
                "Transaction {} is already pending",
                hex::encode(hash)
            )));
        }

        tx.verify().map_err(|e| ChainError::Rejected(e.to_string()))?;
        let transfer = match tx {
            Transaction::Transfer(transfer) => transfer,
            Transaction::Coinbase(_) => {
                return Err(ChainError::Rejected(
                    "Coinbase transactions are never relayed".to_string(),
                ))
            }
        };

        let onchain_nonce = state.get_nonce(&transfer.sender);
        if transfer.nonce <= onchain_nonce {
            return Err(ChainError::Rejected(format!(
                "Nonce {} already used (account nonce is {})",
                transfer.nonce, onchain_nonce
            )));
        }
        if transfer.nonce > onchain_nonce + MAX_NONCE_GAP {
            return Err(ChainError::Rejected(format!(
                "Nonce {} is too far ahead of account nonce {}",
                transfer.nonce, onchain_nonce
            )));
        }
        if self
            .by_sender_nonce
            .contains_key(&(transfer.sender, transfer.nonce))
        {
            return Err(ChainError::Rejected(format!(
                "A transaction with nonce {} from {} is already pending",
                transfer.nonce,
                hex::encode(transfer.sender)
            )));
        }

        let balance = state.get_balance(&transfer.sender);
        if transfer.amount > balance {
            return Err(ChainError::Rejected(format!(
                "Insufficient balance: has {}, sends {}",
                balance, transfer.amount
            )));
        }

        if self.transactions.len() >= self.capacity {
            return Err(ChainError::Rejected("Mempool is full".to_string()));
        }

        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.by_sender_nonce
            .insert((transfer.sender, transfer.nonce), hash);
        self.transactions
            .insert(
                hash,
                PendingTx {
                    tx: transfer,
                    arrival,
                    stalled_rounds: 0,
                },
            );
        Ok(hash)
    }

    fn ordered(&self) -> Vec<&PendingTx> {
        let mut pending: Vec<&PendingTx> = self.transactions.values().collect();
        pending.sort_by_key(|p| p.arrival);
        pending
    }

    /// Nonce the sender's next transfer should carry, counting the ones already queued
    /// back to back after the on-chain nonce.
    pub fn next_nonce(&self, sender: &Address, state: &State) -> u64 {
        let mut nonce = state.get_nonce(sender) + 1;
        while self.by_sender_nonce.contains_key(&(*sender, nonce)) {
            nonce += 1;
        }
        nonce
    }

    /// All pending transactions in arrival order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.ordered()
            .into_iter()
            .map(|p| Transaction::Transfer(p.tx.clone()))
            .collect()
    }

    /// Picks up to `limit` transfers that apply, in order, on top of `state`.
    /// Arrival order wins across senders; each sender's nonces come out contiguous
    /// and ascending. Transfers that would not apply are skipped, not removed.
    pub fn take_for_block(&self, state: &State, limit: usize) -> Vec<Transaction> {
        let pending = self.ordered();
        let mut simulated = state.clone();
        let mut taken = vec![false; pending.len()];
        let mut selected = Vec::new();

        loop {
            let mut progressed = false;
            for (i, entry) in pending.iter().enumerate() {
                if selected.len() >= limit {
                    return selected;
                }
                if taken[i] {
                    continue;
                }
                if simulated.apply_transfer(&entry.tx).is_ok() {
                    taken[i] = true;
                    selected.push(Transaction::Transfer(entry.tx.clone()));
                    progressed = true;
                }
            }
            if !progressed {
                return selected;
            }
        }
    }

    fn remove_one(&mut self, hash: &Sha256Hash) -> Option<TransferTx> {
        let pending = self.transactions.remove(hash)?;
        self.by_sender_nonce
            .remove(&(pending.tx.sender, pending.tx.nonce));
        Some(pending.tx)
    }

    /// Evicts the given hashes. Returns how many were actually pending.
    pub fn remove(&mut self, hashes: &[Sha256Hash]) -> usize {
        hashes
            .iter()
            .filter(|hash| self.remove_one(hash).is_some())
            .count()
    }

    /// Drops entries whose nonce is consumed on chain or whose sender can no longer
    /// fund them, and entries that have waited behind a missing nonce for
    /// [`MAX_STALLED_ROUNDS`] calls. Returns the number evicted.
    pub fn prune_stale(&mut self, state: &State) -> usize {
        let queued = &self.by_sender_nonce;
        let mut stale = Vec::new();

        for (hash, pending) in self.transactions.iter_mut() {
            let sender = pending.tx.sender;
            let onchain_nonce = state.get_nonce(&sender);
            if pending.tx.nonce <= onchain_nonce || pending.tx.amount > state.get_balance(&sender) {
                stale.push(*hash);
                continue;
            }

            let reachable =
                (onchain_nonce + 1..pending.tx.nonce).all(|n| queued.contains_key(&(sender, n)));
            if reachable {
                pending.stalled_rounds = 0;
            } else {
                pending.stalled_rounds += 1;
                if pending.stalled_rounds >= MAX_STALLED_ROUNDS {
                    stale.push(*hash);
                }
            }
        }
        self.remove(&stale)
    }

    /// Re-admits transfers from blocks abandoned by a reorg. Ones that are no longer
    /// plausible against `state` are dropped silently. Returns the number re-admitted.
    pub fn readmit<I>(&mut self, transactions: I, state: &State) -> usize
    where
        I: IntoIterator<Item = Transaction>,
    {
        transactions
            .into_iter()
            .filter(|tx| !tx.is_coinbase())
            .filter(|tx| self.add(tx.clone(), state).is_ok())
            .count()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.by_sender_nonce.clear();
    }
}
