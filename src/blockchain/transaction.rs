use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::chain::{Ledger, LedgerError};
use super::crypto::{CryptoError, Credentials, OwnershipVerifier};

/// `out_index` carried by the coinbase input: no prior output is referenced
pub const COINBASE_OUT_INDEX: i64 = -1;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// An amount locked to an owner token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub owner_token: String,
}

impl TxOutput {
    pub fn new(value: u64, owner_token: impl Into<String>) -> Self {
        TxOutput {
            value,
            owner_token: owner_token.into(),
        }
    }

    /// Whether the output belongs to `token`
    pub fn is_locked_with(&self, token: &str) -> bool {
        self.owner_token == token
    }
}

/// A reference to a previous output being spent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output, empty for coinbase
    pub ref_tx_id: Vec<u8>,

    /// Index into that transaction's outputs, `-1` for coinbase
    pub out_index: i64,

    /// Proof produced by the spender; the memo for coinbase inputs
    pub unlock_token: String,
}

impl TxInput {
    /// Bytes the spender signs: the referenced output plus the spending
    /// transaction's outputs
    pub fn signing_payload(&self, outputs: &[TxOutput]) -> Result<Vec<u8>, TransactionError> {
        Ok(bincode::serialize(&(&self.ref_tx_id, self.out_index, outputs))?)
    }

    /// Whether `owner` authorised this input
    pub fn can_unlock(
        &self,
        owner: &str,
        outputs: &[TxOutput],
        verifier: &dyn OwnershipVerifier,
    ) -> Result<bool, TransactionError> {
        let payload = self.signing_payload(outputs)?;
        Ok(verifier.verify(owner, &payload, &self.unlock_token))
    }
}

/// Represents a value transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the encoded (inputs, outputs) pair
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates a transaction and computes its id
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Result<Self, TransactionError> {
        let mut tx = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        tx.set_id()?;
        Ok(tx)
    }

    /// Creates the value-issuing transaction
    ///
    /// # Arguments
    ///
    /// * `to` - The token credited with the reward
    /// * `memo` - Free text stored in the input, defaults to `"Coins to {to}"`
    /// * `reward` - The amount issued
    pub fn coinbase(to: &str, memo: &str, reward: u64) -> Result<Self, TransactionError> {
        let memo = if memo.is_empty() {
            format!("Coins to {to}")
        } else {
            memo.to_string()
        };

        let input = TxInput {
            ref_tx_id: Vec::new(),
            out_index: COINBASE_OUT_INDEX,
            unlock_token: memo,
        };

        Self::new(vec![input], vec![TxOutput::new(reward, to)])
    }

    /// Builds a transfer of `amount` from `from` to `to` out of outputs found on the ledger
    ///
    /// Inputs are selected greedily; any excess comes back to `from.public`
    /// as a change output.
    pub fn new_transfer(
        from: &Credentials,
        to: &str,
        amount: u64,
        ledger: &Ledger,
    ) -> Result<Self, LedgerError> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount("transfer amount must be positive".to_string()).into());
        }

        let (accumulated, selection) = ledger.find_spendable_outputs(&from.public, amount)?;

        if accumulated < amount {
            warn!(
                "Rejected transfer of {} from {}: only {} spendable",
                amount, from.public, accumulated
            );
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: accumulated,
            }
            .into());
        }

        let mut outputs = vec![TxOutput::new(amount, to)];
        if accumulated > amount {
            outputs.push(TxOutput::new(accumulated - amount, from.public.clone()));
        }

        let verifier = ledger.verifier();
        let mut inputs = Vec::new();

        for (tx_id, out_indices) in &selection {
            let ref_tx_id = hex::decode(tx_id)
                .map_err(|e| LedgerError::Corrupt(format!("unspent transaction id {tx_id}: {e}")))?;

            for &out_index in out_indices {
                let mut input = TxInput {
                    ref_tx_id: ref_tx_id.clone(),
                    out_index,
                    unlock_token: String::new(),
                };
                let payload = input.signing_payload(&outputs)?;
                input.unlock_token = verifier
                    .sign(from.secret(), &payload)
                    .map_err(TransactionError::from)?;
                inputs.push(input);
            }
        }

        let tx = Self::new(inputs, outputs)?;
        debug!(
            "Built transfer {} of {} from {} to {} with {} inputs",
            tx.id_hex(),
            amount,
            from.public,
            to,
            tx.inputs.len()
        );
        Ok(tx)
    }

    /// Recomputes the id from the current inputs and outputs
    pub fn set_id(&mut self) -> Result<(), TransactionError> {
        self.id = self.compute_id()?;
        Ok(())
    }

    /// Whether the stored id matches the content
    pub fn verify_id(&self) -> Result<bool, TransactionError> {
        Ok(self.compute_id()? == self.id)
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].ref_tx_id.is_empty()
            && self.inputs[0].out_index == COINBASE_OUT_INDEX
    }

    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    fn compute_id(&self) -> Result<Vec<u8>, TransactionError> {
        let encoded = bincode::serialize(&(&self.inputs, &self.outputs))?;
        Ok(Sha256::digest(&encoded).to_vec())
    }
}
