use std::path::Path;

use sled::transaction::{
    abort, ConflictableTransactionResult, TransactionError, TransactionalTree,
    UnabortableTransactionError,
};
use sled::Db;
use thiserror::Error;

use super::block::Block;

/// Key holding the hash of the current chain tip
pub const LAST_HASH_KEY: &[u8] = b"lh";

/// Key holding the difficulty the chain was created with, as a big-endian u32
pub const DIFFICULTY_KEY: &[u8] = b"difficulty";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Store already exists: {0}")]
    AlreadyExists(String),
}

/// Durable store of blocks keyed by hash plus the `"lh"` tip pointer
pub struct ChainStore {
    db: Db,
}

impl std::fmt::Debug for ChainStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainStore").finish()
    }
}

/// View over the store inside an atomic transaction
pub struct StoreTxn<'a> {
    tree: &'a TransactionalTree,
}

impl StoreTxn<'_> {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, UnabortableTransactionError> {
        Ok(self.tree.get(key)?.map(|value| value.to_vec()))
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), UnabortableTransactionError> {
        self.tree.insert(key, value)?;
        Ok(())
    }
}

impl ChainStore {
    /// Creates a fresh store at `path`
    ///
    /// # Returns
    ///
    /// `StorageError::AlreadyExists` if a store is already present there
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if Self::exists(path) {
            return Err(StorageError::AlreadyExists(path.display().to_string()));
        }

        Ok(ChainStore {
            db: sled::open(path)?,
        })
    }

    /// Opens an existing store at `path`
    ///
    /// # Returns
    ///
    /// `StorageError::NotFound` if no store is present there
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if !Self::exists(path) {
            return Err(StorageError::NotFound(path.display().to_string()));
        }

        Ok(ChainStore {
            db: sled::open(path)?,
        })
    }

    /// Whether a store has been created at `path`
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().join("db").exists()
    }

    #[cfg(test)]
    pub(crate) fn temporary() -> Result<Self, StorageError> {
        Ok(ChainStore {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    /// Runs `f` inside an atomic read-write transaction
    ///
    /// Transactions are serializable: when two writers race on the same key,
    /// the loser's closure is re-run against the committed state.
    pub fn write_txn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: Fn(&StoreTxn<'_>) -> ConflictableTransactionResult<T, E>,
        E: From<StorageError>,
    {
        self.db
            .transaction(|tree| f(&StoreTxn { tree }))
            .map_err(|err| match err {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => E::from(StorageError::from(e)),
            })
    }

    /// Runs `f` against a consistent snapshot of the store
    pub fn read_txn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: Fn(&StoreTxn<'_>) -> ConflictableTransactionResult<T, E>,
        E: From<StorageError>,
    {
        self.write_txn(f)
    }

    /// Reads the current tip hash
    pub fn last_hash(&self) -> Result<Vec<u8>, StorageError> {
        self.read_txn(|txn| -> ConflictableTransactionResult<Vec<u8>, StorageError> {
            match txn.get(LAST_HASH_KEY)? {
                Some(hash) => Ok(hash),
                None => abort(StorageError::NotFound("last hash".to_string())),
            }
        })
    }

    /// Reads the difficulty recorded when the chain was created
    pub fn difficulty(&self) -> Result<Option<u32>, StorageError> {
        let stored = self.read_txn(|txn| -> ConflictableTransactionResult<Option<Vec<u8>>, StorageError> {
            Ok(txn.get(DIFFICULTY_KEY)?)
        })?;

        stored
            .map(|bytes| {
                <[u8; 4]>::try_from(bytes.as_slice())
                    .map(u32::from_be_bytes)
                    .map_err(|_| {
                        StorageError::SerializationError(format!(
                            "difficulty record has {} bytes, expected 4",
                            bytes.len()
                        ))
                    })
            })
            .transpose()
    }

    /// Reads and decodes the block stored under `hash`
    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>, StorageError> {
        let encoded = self.read_txn(|txn| -> ConflictableTransactionResult<Option<Vec<u8>>, StorageError> {
            Ok(txn.get(hash)?)
        })?;

        encoded
            .map(|bytes| {
                Block::deserialize(&bytes)
                    .map_err(|e| StorageError::SerializationError(e.to_string()))
            })
            .transpose()
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
