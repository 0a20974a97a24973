use crate::crypto::Address;
use crate::error::ChainError;
use crate::transaction::{Transaction, TransferTx};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub balance: u64,
    /// Number of transfers this account has sent.
    pub nonce: u64,
}

/// Account balances and nonces. Cloning is the snapshot operation: validation always
/// runs against a clone and only a fully validated result replaces the original.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct State {
    accounts: HashMap<Address, Account>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn get_balance(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.balance)
    }

    pub fn get_nonce(&self, address: &Address) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.nonce)
    }

    /// The nonce the next transfer from `address` must carry.
    pub fn expected_nonce(&self, address: &Address) -> u64 {
        self.get_nonce(address) + 1
    }

    pub fn exists(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn total_supply(&self) -> u128 {
        self.accounts.values().map(|a| a.balance as u128).sum()
    }

    /// Unconditionally credits `amount` (mining reward, genesis treasury).
    pub fn apply_block_reward(&mut self, address: Address, amount: u64) -> Result<(), ChainError> {
        let account = self.accounts.entry(address).or_default();
        account.balance = account.balance.checked_add(amount).ok_or_else(|| {
            ChainError::InvalidTransaction(format!(
                "Balance overflow crediting {}",
                hex::encode(address)
            ))
        })?;
        Ok(())
    }

    /// Checks a transfer against the current balances and nonces without applying it.
    pub fn check_transfer(&self, tx: &TransferTx) -> Result<(), ChainError> {
        let sender = self.accounts.get(&tx.sender).ok_or_else(|| {
            ChainError::InvalidTransaction(format!(
                "Sender {} does not exist",
                hex::encode(tx.sender)
            ))
        })?;

        let expected_nonce = sender.nonce + 1;
        if tx.nonce != expected_nonce {
            return Err(ChainError::InvalidTransaction(format!(
                "Bad nonce for {}: expected {}, got {}",
                hex::encode(tx.sender),
                expected_nonce,
                tx.nonce
            )));
        }

        if sender.balance < tx.amount {
            return Err(ChainError::InvalidTransaction(format!(
                "Insufficient balance: {} has {} but sends {}",
                hex::encode(tx.sender),
                sender.balance,
                tx.amount
            )));
        }

        let recipient_balance = self.get_balance(&tx.recipient);
        if recipient_balance.checked_add(tx.amount).is_none() {
            return Err(ChainError::InvalidTransaction(format!(
                "Balance overflow crediting {}",
                hex::encode(tx.recipient)
            )));
        }
        Ok(())
    }

    /// Applies a transfer. On error the state is left untouched.
    pub fn apply_transfer(&mut self, tx: &TransferTx) -> Result<(), ChainError> {
        self.check_transfer(tx)?;

        let sender = self.accounts.entry(tx.sender).or_default();
        sender.balance -= tx.amount;
        sender.nonce += 1;

        let recipient = self.accounts.entry(tx.recipient).or_default();
        recipient.balance += tx.amount;
        Ok(())
    }

    /// State transition for any transaction kind. Coinbase legitimacy (amount, position)
    /// is a block-level rule and must be checked by the caller.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        match tx {
            Transaction::Coinbase(cb) => self.apply_block_reward(cb.beneficiary, cb.amount),
            Transaction::Transfer(transfer) => self.apply_transfer(transfer),
        }
    }

    /// Functional form: returns the successor state, leaving `self` as it was.
    pub fn apply(&self, tx: &Transaction) -> Result<State, ChainError> {
        let mut next = self.clone();
        next.apply_transaction(tx)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn funded(keypair: &KeyPair, amount: u64) -> State {
        let mut state = State::new();
        state.apply_block_reward(keypair.address(), amount).unwrap();
        state
    }

    #[test]
    fn test_transfer_moves_value_and_bumps_nonce() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut state = funded(&alice, 100);

        let tx = TransferTx::create(&alice, bob.address(), 40, 1).unwrap();
        state.apply_transfer(&tx).unwrap();

        assert_eq!(state.get_balance(&alice.address()), 60);
        assert_eq!(state.get_balance(&bob.address()), 40);
        assert_eq!(state.get_nonce(&alice.address()), 1);
        assert_eq!(state.get_nonce(&bob.address()), 0);
        assert_eq!(state.total_supply(), 100);
    }

    #[test]
    fn test_insufficient_funds_leaves_state_unchanged() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut state = funded(&alice, 10);
        let before = state.clone();

        let tx = TransferTx::create(&alice, bob.address(), 50, 1).unwrap();
        let err = state.apply_transfer(&tx).unwrap_err();

        assert!(matches!(err, ChainError::InvalidTransaction(_)));
        assert_eq!(state, before);
        assert!(!state.exists(&bob.address()));
    }

    #[test]
    fn test_unknown_sender_is_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut state = State::new();
        let tx = TransferTx::create(&alice, bob.address(), 1, 1).unwrap();
        assert!(state.apply_transfer(&tx).is_err());
    }

    #[test]
    fn test_nonce_gap_and_replay_are_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut state = funded(&alice, 100);

        let gap = TransferTx::create(&alice, bob.address(), 1, 2).unwrap();
        assert!(state.apply_transfer(&gap).is_err());

        let first = TransferTx::create(&alice, bob.address(), 1, 1).unwrap();
        state.apply_transfer(&first).unwrap();
        assert!(state.apply_transfer(&first).is_err());
        assert_eq!(state.get_nonce(&alice.address()), 1);
    }

    #[test]
    fn test_functional_apply_does_not_mutate() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let state = funded(&alice, 100);
        let tx = Transaction::Transfer(TransferTx::create(&alice, bob.address(), 30, 1).unwrap());

        let next = state.apply(&tx).unwrap();
        assert_eq!(state.get_balance(&alice.address()), 100);
        assert_eq!(next.get_balance(&alice.address()), 70);
    }

    #[test]
    fn test_reward_overflow_is_an_error() {
        let alice = KeyPair::generate();
        let mut state = funded(&alice, u64::MAX);
        assert!(state.apply_block_reward(alice.address(), 1).is_err());
        assert_eq!(state.get_balance(&alice.address()), u64::MAX);
    }
}
