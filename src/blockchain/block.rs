use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::proof::{CancelToken, MiningParams, ProofOfWork};
use super::transaction::Transaction;

/// Errors that can occur while building or encoding blocks
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Invalid difficulty {0}: expected 1 to 255 leading zero bits")]
    InvalidDifficulty(u32),

    #[error("Mining cancelled")]
    MiningCancelled,

    #[error("Nonce space exhausted without meeting the target")]
    NonceSpaceExhausted,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Represents a sealed block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Proof-of-work hash identifying the block
    pub hash: Vec<u8>,

    /// Transactions included in this block, never empty
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, empty for the origin block
    pub prev_hash: Vec<u8>,

    /// Proof-of-work solution
    pub nonce: u64,
}

impl Block {
    /// Builds and mines a block on top of `prev_hash`
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to seal in the block
    /// * `prev_hash` - The hash of the current chain tip
    /// * `difficulty` - Leading zero bits the hash must carry
    ///
    /// # Returns
    ///
    /// The sealed block with `hash` and `nonce` populated
    pub fn create(transactions: Vec<Transaction>, prev_hash: Vec<u8>, difficulty: u32) -> Result<Self, BlockError> {
        Self::mine(transactions, prev_hash, MiningParams::new(difficulty), &CancelToken::new())
    }

    /// Builds and mines a block, honouring the mining parameters and cancellation
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        params: MiningParams,
        cancel: &CancelToken,
    ) -> Result<Self, BlockError> {
        let digest = hash_transactions(&transactions);
        let pow = ProofOfWork::new(&digest, &prev_hash, params.difficulty)?;
        let (nonce, hash) = pow.solve(params, cancel)?;

        Ok(Block {
            hash: hash.to_vec(),
            transactions,
            prev_hash,
            nonce,
        })
    }

    /// Builds the origin block around the coinbase transaction
    pub fn genesis(coinbase: Transaction, params: MiningParams) -> Result<Self, BlockError> {
        Self::mine(vec![coinbase], Vec::new(), params, &CancelToken::new())
    }

    /// Whether this block is the origin of the chain
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Digest of the concatenated transaction ids
    pub fn hash_transactions(&self) -> [u8; 32] {
        hash_transactions(&self.transactions)
    }

    /// Recomputes the proof of work from the stored nonce
    ///
    /// # Returns
    ///
    /// true if the recomputed hash meets the target and equals `hash`
    pub fn verify_proof(&self, difficulty: u32) -> Result<bool, BlockError> {
        let digest = self.hash_transactions();
        let pow = ProofOfWork::new(&digest, &self.prev_hash, difficulty)?;
        Ok(pow.validate(self.nonce, &self.hash))
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, BlockError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, BlockError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn hash_transactions(transactions: &[Transaction]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for tx in transactions {
        hasher.update(&tx.id);
    }
    hasher.finalize().into()
}
