// Blockchain module
//
// This module contains the core ledger implementation including:
// - Proof of work engine
// - Block structure
// - Transaction and UTXO model
// - Ownership verification
// - Chain store
// - Ledger queries over the chain

pub mod block;
pub mod chain;
pub mod crypto;
pub mod proof;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::{Block, BlockError};
pub use chain::{ChainIterator, Ledger, LedgerError};
pub use crypto::{Credentials, Ed25519Verifier, OwnershipVerifier, TokenVerifier, Wallet};
pub use proof::{CancelToken, MiningParams, ProofOfWork};
pub use storage::{ChainStore, StorageError};
pub use transaction::{Transaction, TransactionError, TxInput, TxOutput};
