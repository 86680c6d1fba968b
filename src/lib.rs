//! A minimal proof-of-work ledger: hash-linked blocks of UTXO transactions
//! persisted in an embedded key-value store.

pub mod blockchain;
pub mod config;
