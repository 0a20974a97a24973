/// Stateless validation for transactions. Balance and nonce checks need context and
/// live in [`crate::blockchain::State`].
use crate::crypto::{address_from_public_key, ZERO_HASH};
use crate::error::ChainError;
use crate::transaction::types::{CoinbaseTx, Transaction, TransferTx};

impl Transaction {
    /// Checks structure and, for transfers, the signature.
    pub fn verify(&self) -> Result<(), ChainError> {
        self.validate_size()?;
        match self {
            Transaction::Transfer(tx) => tx.verify(),
            Transaction::Coinbase(tx) => tx.verify(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }
}

impl CoinbaseTx {
    pub fn verify(&self) -> Result<(), ChainError> {
        if self.amount == 0 {
            return Err(ChainError::InvalidTransaction(
                "Coinbase amount must be greater than zero".to_string(),
            ));
        }
        if self.beneficiary == ZERO_HASH {
            return Err(ChainError::InvalidTransaction(
                "Coinbase beneficiary address cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl TransferTx {
    /// Stateless validation: addresses, amount, key/address binding and signature.
    pub fn verify(&self) -> Result<(), ChainError> {
        if !self.is_signed() {
            return Err(ChainError::InvalidSignature(
                "Transfer not signed".to_string(),
            ));
        }

        if self.sender == ZERO_HASH {
            return Err(ChainError::InvalidTransaction(
                "Sender address cannot be empty".to_string(),
            ));
        }
        if self.recipient == ZERO_HASH {
            return Err(ChainError::InvalidTransaction(
                "Recipient address cannot be empty".to_string(),
            ));
        }
        if self.sender == self.recipient {
            return Err(ChainError::InvalidTransaction(
                "Sender and recipient cannot be the same".to_string(),
            ));
        }
        if self.amount == 0 {
            return Err(ChainError::InvalidTransaction(
                "Transfer amount must be positive".to_string(),
            ));
        }
        if self.nonce == 0 {
            return Err(ChainError::InvalidTransaction(
                "Transfer nonce starts at 1".to_string(),
            ));
        }

        if address_from_public_key(&self.public_key) != self.sender {
            return Err(ChainError::InvalidSignature(format!(
                "Public key does not belong to sender {}",
                hex::encode(self.sender)
            )));
        }

        crate::crypto::verify_signature(&self.public_key, &self.signable_message(), &self.signature)
    }
}
