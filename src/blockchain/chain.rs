use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use log::{debug, info, warn};
use sled::transaction::{abort, ConflictableTransactionError, ConflictableTransactionResult};
use thiserror::Error;

use super::block::{Block, BlockError};
use super::crypto::{Credentials, OwnershipVerifier};
use super::proof::{CancelToken, MiningParams};
use super::storage::{ChainStore, StorageError, DIFFICULTY_KEY, LAST_HASH_KEY};
use super::transaction::{Transaction, TransactionError, TxOutput};
use crate::config::{ConfigError, LedgerConfig};

/// Memo carried by the origin block's coinbase input
pub const GENESIS_MEMO: &str = "First Transaction from Genesis";

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Corrupt chain: {0}")]
    Corrupt(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Coinbase transaction {0} is only allowed in the genesis block")]
    CoinbaseOutsideGenesis(String),

    #[error("Chain was created with difficulty {stored}, configured {configured}")]
    DifficultyMismatch { stored: u32, configured: u32 },
}

fn aborted(err: impl Into<LedgerError>) -> ConflictableTransactionError<LedgerError> {
    ConflictableTransactionError::Abort(err.into())
}

/// Unspent outputs of one transaction that belong to the queried owner
type UnspentEntry = (Transaction, Vec<usize>);

/// The ledger: a handle to the chain store plus a cached copy of the tip hash
pub struct Ledger {
    store: ChainStore,

    /// Cache of the `"lh"` key; the store stays authoritative
    last_hash: RwLock<Vec<u8>>,

    mining: MiningParams,

    verifier: Arc<dyn OwnershipVerifier>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("last_hash", &hex::encode(self.last_hash()))
            .field("mining", &self.mining)
            .field("verifier", &self.verifier)
            .finish()
    }
}

impl Ledger {
    /// Creates a new ledger whose origin block credits `owner` with the reward
    ///
    /// The genesis block is mined before anything touches disk, and a store
    /// that fails to take the genesis record is removed again.
    ///
    /// # Returns
    ///
    /// `StorageError::AlreadyExists` if a store is already present at `config.data_dir`
    pub fn init(config: &LedgerConfig, owner: &str) -> Result<Self, LedgerError> {
        config.validate()?;
        if ChainStore::exists(&config.data_dir) {
            return Err(StorageError::AlreadyExists(config.data_dir.display().to_string()).into());
        }

        let coinbase = Transaction::coinbase(owner, GENESIS_MEMO, config.reward)?;
        let genesis = Block::genesis(coinbase, config.mining_params())?;
        let encoded = genesis.serialize()?;

        let store = ChainStore::create(&config.data_dir)?;
        if let Err(err) = write_genesis(&store, &genesis, &encoded, config.difficulty) {
            drop(store);
            if let Err(cleanup) = std::fs::remove_dir_all(&config.data_dir) {
                warn!(
                    "Failed to remove incomplete store at {}: {}",
                    config.data_dir.display(),
                    cleanup
                );
            }
            return Err(err);
        }

        info!(
            "Genesis block {} created, {} coins to {}",
            genesis.hash_hex(),
            config.reward,
            owner
        );

        Ok(Ledger {
            store,
            last_hash: RwLock::new(genesis.hash),
            mining: config.mining_params(),
            verifier: config.verifier.build(),
        })
    }

    /// Opens the ledger stored at `config.data_dir`
    ///
    /// # Returns
    ///
    /// `StorageError::NotFound` if there is no store or it has no tip, and
    /// `LedgerError::DifficultyMismatch` if `config.difficulty` differs from
    /// the difficulty the chain was created with
    pub fn resume(config: &LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;

        let store = ChainStore::open(&config.data_dir)?;
        let last_hash = store.last_hash()?;
        let stored = store
            .difficulty()?
            .ok_or_else(|| LedgerError::Corrupt("store has no difficulty record".to_string()))?;

        if stored != config.difficulty {
            warn!(
                "Refusing to resume: chain was mined at difficulty {}, configured {}",
                stored, config.difficulty
            );
            return Err(LedgerError::DifficultyMismatch {
                stored,
                configured: config.difficulty,
            });
        }

        info!("Resumed ledger at tip {}", hex::encode(&last_hash));

        Ok(Ledger {
            store,
            last_hash: RwLock::new(last_hash),
            mining: config.mining_params(),
            verifier: config.verifier.build(),
        })
    }

    /// Replaces the ownership verifier
    pub fn with_verifier(mut self, verifier: Arc<dyn OwnershipVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn verifier(&self) -> &dyn OwnershipVerifier {
        self.verifier.as_ref()
    }

    pub fn mining_params(&self) -> MiningParams {
        self.mining
    }

    /// Cached hash of the chain tip
    pub fn last_hash(&self) -> Vec<u8> {
        self.last_hash
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reloads the cached tip from the store
    pub fn refresh_last_hash(&self) -> Result<Vec<u8>, LedgerError> {
        let tip = self.store.last_hash()?;
        *self
            .last_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner) = tip.clone();
        Ok(tip)
    }

    /// Mines a block holding `transactions` on top of the stored tip
    pub fn append(&self, transactions: Vec<Transaction>) -> Result<Block, LedgerError> {
        self.append_with_cancel(transactions, &CancelToken::new())
    }

    /// Like [`Ledger::append`], but the nonce search stops once `cancel` fires
    ///
    /// The batch is verified against the stored tip. The tip is then re-read,
    /// the block mined, and the record and tip written in a single store
    /// transaction; if another writer moved the tip in between, nothing is
    /// written and verification starts over from the new tip.
    pub fn append_with_cancel(
        &self,
        transactions: Vec<Transaction>,
        cancel: &CancelToken,
    ) -> Result<Block, LedgerError> {
        if transactions.is_empty() {
            return Err(LedgerError::InvalidBlock(
                "a block must carry at least one transaction".to_string(),
            ));
        }
        for tx in &transactions {
            check_appendable(tx)?;
        }

        let block = loop {
            let verified_tip = self.refresh_last_hash()?;
            self.verify_batch(&transactions, &verified_tip)?;

            let mined = self
                .store
                .write_txn(|txn| -> ConflictableTransactionResult<Option<Block>, LedgerError> {
                    let tip = match txn.get(LAST_HASH_KEY)? {
                        Some(tip) => tip,
                        None => return abort(StorageError::NotFound("last hash".to_string()).into()),
                    };
                    if tip != verified_tip {
                        return Ok(None);
                    }

                    let block = Block::mine(transactions.clone(), tip, self.mining, cancel)
                        .map_err(aborted)?;
                    let encoded = block.serialize().map_err(aborted)?;

                    txn.set(&block.hash, &encoded)?;
                    txn.set(LAST_HASH_KEY, &block.hash)?;
                    Ok(Some(block))
                })?;

            match mined {
                Some(block) => break block,
                None => debug!(
                    "Tip moved past {} before mining, verifying again",
                    hex::encode(&verified_tip)
                ),
            }
        };

        *self
            .last_hash
            .write()
            .unwrap_or_else(PoisonError::into_inner) = block.hash.clone();

        info!(
            "Mined block {} (nonce {}, {} transactions)",
            block.hash_hex(),
            block.nonce,
            block.transactions.len()
        );

        Ok(block)
    }

    /// Builds a transfer and appends it in its own block
    pub fn send(&self, from: &Credentials, to: &str, amount: u64) -> Result<Block, LedgerError> {
        let tx = Transaction::new_transfer(from, to, amount, self)?;
        self.append(vec![tx])
    }

    /// Walks the chain from the cached tip back to the origin block
    pub fn iterator(&self) -> ChainIterator<'_> {
        self.walk_from(self.last_hash())
    }

    fn walk_from(&self, tip: Vec<u8>) -> ChainIterator<'_> {
        ChainIterator {
            current_hash: tip,
            store: &self.store,
        }
    }

    /// All blocks, newest first
    pub fn blocks(&self) -> Result<Vec<Block>, LedgerError> {
        self.iterator().collect()
    }

    /// Transactions that still hold at least one unspent output owned by `owner`
    pub fn find_unspent_transactions(&self, owner: &str) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self
            .scan_unspent(owner)?
            .into_iter()
            .map(|(tx, _)| tx)
            .collect())
    }

    /// Unspent outputs owned by `owner`
    pub fn find_utxo(&self, owner: &str) -> Result<Vec<TxOutput>, LedgerError> {
        Ok(self
            .scan_unspent(owner)?
            .into_iter()
            .flat_map(|(tx, indices)| {
                indices
                    .into_iter()
                    .map(move |idx| tx.outputs[idx].clone())
            })
            .collect())
    }

    /// Greedily selects unspent outputs of `owner` until `amount` is covered
    ///
    /// # Returns
    ///
    /// The accumulated value and the selected output indices keyed by hex
    /// transaction id. The total may fall short of `amount`; callers decide
    /// whether that is an error.
    pub fn find_spendable_outputs(
        &self,
        owner: &str,
        amount: u64,
    ) -> Result<(u64, BTreeMap<String, Vec<i64>>), LedgerError> {
        let mut selection: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        let mut accumulated: u64 = 0;

        'work: for (tx, indices) in self.scan_unspent(owner)? {
            let tx_id = tx.id_hex();

            for idx in indices {
                if accumulated >= amount {
                    break 'work;
                }
                accumulated = accumulated.saturating_add(tx.outputs[idx].value);
                selection.entry(tx_id.clone()).or_default().push(idx as i64);
            }
        }

        Ok((accumulated, selection))
    }

    /// Looks a transaction up by id, newest blocks first
    pub fn find_transaction(&self, id: &[u8]) -> Result<Option<Transaction>, LedgerError> {
        for block in self.iterator() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == id) {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Checks `tx` against the chain ending at the cached tip
    ///
    /// Every input must spend an existing, still unspent output and carry a
    /// proof accepted for that output's owner; no output may be spent twice
    /// and the outputs may not exceed the inputs in value.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<(), LedgerError> {
        self.verify_batch(std::slice::from_ref(tx), &self.last_hash())
    }

    /// Verifies a batch against the chain ending at `tip` in a single walk
    ///
    /// Inputs may only reference transactions already on chain, so a batch
    /// cannot spend its own outputs.
    fn verify_batch(&self, transactions: &[Transaction], tip: &[u8]) -> Result<(), LedgerError> {
        let wanted: HashSet<&[u8]> = transactions
            .iter()
            .flat_map(|tx| tx.inputs.iter().map(|input| input.ref_tx_id.as_slice()))
            .collect();

        let mut referenced: HashMap<Vec<u8>, Transaction> = HashMap::new();
        let mut spent: HashSet<(Vec<u8>, i64)> = HashSet::new();

        for block in self.walk_from(tip.to_vec()) {
            for tx in block?.transactions {
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent.insert((input.ref_tx_id.clone(), input.out_index));
                    }
                }
                if wanted.contains(tx.id.as_slice()) {
                    referenced.entry(tx.id.clone()).or_insert(tx);
                }
            }
        }

        for tx in transactions {
            self.verify_inputs(tx, &referenced, &mut spent)?;
        }
        Ok(())
    }

    /// Checks one transaction's inputs and records them in `spent`
    fn verify_inputs(
        &self,
        tx: &Transaction,
        referenced: &HashMap<Vec<u8>, Transaction>,
        spent: &mut HashSet<(Vec<u8>, i64)>,
    ) -> Result<(), LedgerError> {
        let mut input_total: u64 = 0;

        for input in &tx.inputs {
            let prev = referenced.get(&input.ref_tx_id).ok_or_else(|| {
                LedgerError::InvalidTransaction(format!(
                    "transaction {} spends unknown transaction {}",
                    tx.id_hex(),
                    hex::encode(&input.ref_tx_id)
                ))
            })?;

            let output = usize::try_from(input.out_index)
                .ok()
                .and_then(|idx| prev.outputs.get(idx))
                .ok_or_else(|| {
                    LedgerError::InvalidTransaction(format!(
                        "transaction {} spends missing output {}:{}",
                        tx.id_hex(),
                        prev.id_hex(),
                        input.out_index
                    ))
                })?;

            if !input.can_unlock(&output.owner_token, &tx.outputs, self.verifier())? {
                warn!(
                    "Transaction {} failed ownership check on {}:{}",
                    tx.id_hex(),
                    prev.id_hex(),
                    input.out_index
                );
                return Err(LedgerError::InvalidTransaction(format!(
                    "input {}:{} of transaction {} is not authorised by {}",
                    prev.id_hex(),
                    input.out_index,
                    tx.id_hex(),
                    output.owner_token
                )));
            }

            if !spent.insert((input.ref_tx_id.clone(), input.out_index)) {
                warn!(
                    "Transaction {} spends {}:{} a second time",
                    tx.id_hex(),
                    prev.id_hex(),
                    input.out_index
                );
                return Err(LedgerError::InvalidTransaction(format!(
                    "output {}:{} spent by transaction {} is already spent",
                    prev.id_hex(),
                    input.out_index,
                    tx.id_hex()
                )));
            }

            input_total = input_total.checked_add(output.value).ok_or_else(|| {
                LedgerError::InvalidTransaction(format!("inputs of transaction {} overflow", tx.id_hex()))
            })?;
        }

        let output_total = tx
            .outputs
            .iter()
            .try_fold(0u64, |acc, output| acc.checked_add(output.value))
            .ok_or_else(|| {
                LedgerError::InvalidTransaction(format!("outputs of transaction {} overflow", tx.id_hex()))
            })?;

        if output_total > input_total {
            warn!(
                "Transaction {} pays out {} from {} of inputs",
                tx.id_hex(),
                output_total,
                input_total
            );
            return Err(LedgerError::InvalidTransaction(format!(
                "transaction {} pays out {} but only spends {}",
                tx.id_hex(),
                output_total,
                input_total
            )));
        }
        Ok(())
    }

    /// Sum of the unspent outputs owned by `owner`
    pub fn balance(&self, owner: &str) -> Result<u64, LedgerError> {
        Ok(self
            .find_utxo(owner)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    /// Revalidates every block from the tip back to the origin
    ///
    /// # Returns
    ///
    /// The number of blocks checked
    pub fn validate_chain(&self) -> Result<usize, LedgerError> {
        let mut expected_hash = self.last_hash();
        let mut checked = 0;

        for block in self.iterator() {
            let block = block?;

            if block.hash != expected_hash {
                warn!("Block stored under {} carries hash {}", hex::encode(&expected_hash), block.hash_hex());
                return Err(LedgerError::InvalidBlock(format!(
                    "block stored under {} carries hash {}",
                    hex::encode(&expected_hash),
                    block.hash_hex()
                )));
            }
            if !block.verify_proof(self.mining.difficulty)? {
                warn!("Block {} fails proof of work", block.hash_hex());
                return Err(LedgerError::InvalidBlock(format!(
                    "block {} fails proof of work",
                    block.hash_hex()
                )));
            }
            if block.transactions.is_empty() {
                return Err(LedgerError::InvalidBlock(format!(
                    "block {} has no transactions",
                    block.hash_hex()
                )));
            }
            for tx in &block.transactions {
                if tx.is_coinbase() && !block.is_genesis() {
                    return Err(LedgerError::CoinbaseOutsideGenesis(tx.id_hex()));
                }
                if !tx.verify_id()? {
                    return Err(LedgerError::InvalidBlock(format!(
                        "transaction {} in block {} has a mismatched id",
                        tx.id_hex(),
                        block.hash_hex()
                    )));
                }
            }

            expected_hash = block.prev_hash;
            checked += 1;
        }

        debug!("Validated {} blocks", checked);
        Ok(checked)
    }

    /// Walks the chain newest to oldest, masking outputs spent by `owner`
    ///
    /// Transactions inside a block are visited in block order. A spend is
    /// always recorded before the output it consumes is examined, because
    /// appended inputs may only reference transactions in earlier blocks.
    fn scan_unspent(&self, owner: &str) -> Result<Vec<UnspentEntry>, LedgerError> {
        let mut unspent = Vec::new();
        let mut spent: HashMap<String, HashSet<i64>> = HashMap::new();

        for block in self.iterator() {
            let block = block?;

            for tx in block.transactions {
                let spent_outs = spent.get(&tx.id_hex());
                let indices: Vec<usize> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(idx, output)| {
                        !spent_outs.is_some_and(|outs| outs.contains(&(*idx as i64)))
                            && output.is_locked_with(owner)
                    })
                    .map(|(idx, _)| idx)
                    .collect();

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        if input.can_unlock(owner, &tx.outputs, self.verifier())? {
                            spent
                                .entry(hex::encode(&input.ref_tx_id))
                                .or_default()
                                .insert(input.out_index);
                        }
                    }
                }

                if !indices.is_empty() {
                    unspent.push((tx, indices));
                }
            }
        }

        Ok(unspent)
    }
}

/// Writes the genesis record, tip and difficulty in one transaction and flushes them
fn write_genesis(
    store: &ChainStore,
    genesis: &Block,
    encoded: &[u8],
    difficulty: u32,
) -> Result<(), LedgerError> {
    store.write_txn(|txn| -> ConflictableTransactionResult<(), LedgerError> {
        txn.set(&genesis.hash, encoded)?;
        txn.set(LAST_HASH_KEY, &genesis.hash)?;
        txn.set(DIFFICULTY_KEY, &difficulty.to_be_bytes())?;
        Ok(())
    })?;
    store.flush()?;
    Ok(())
}

/// Rejects coinbase issuance and transactions whose id does not match their content
fn check_appendable(tx: &Transaction) -> Result<(), LedgerError> {
    if tx.is_coinbase() {
        return Err(LedgerError::CoinbaseOutsideGenesis(tx.id_hex()));
    }
    if !tx.verify_id()? {
        return Err(LedgerError::InvalidBlock(format!(
            "transaction {} has a mismatched id",
            tx.id_hex()
        )));
    }
    Ok(())
}

/// Cursor walking from a tip back to the origin block via `prev_hash`
///
/// Ends after the origin block; a missing block yields `LedgerError::Corrupt`
/// once and ends the walk.
pub struct ChainIterator<'a> {
    current_hash: Vec<u8>,
    store: &'a ChainStore,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }

        let current = std::mem::take(&mut self.current_hash);
        let block = match self.store.get_block(&current) {
            Ok(Some(block)) => block,
            Ok(None) => {
                return Some(Err(LedgerError::Corrupt(format!(
                    "block {} is referenced but missing",
                    hex::encode(&current)
                ))))
            }
            Err(e) => return Some(Err(e.into())),
        };

        self.current_hash = block.prev_hash.clone();
        Some(Ok(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::transaction::TxInput;
    use crate::config::VerifierKind;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> LedgerConfig {
        LedgerConfig {
            data_dir: dir.path().join("blocks"),
            difficulty: 8,
            reward: 100,
            ..LedgerConfig::default()
        }
    }

    fn ledger_for(owner: &str) -> (TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::init(&config(&dir), owner).unwrap();
        (dir, ledger)
    }

    fn total(outputs: &[TxOutput]) -> u64 {
        outputs.iter().map(|output| output.value).sum()
    }

    #[test]
    fn test_fresh_ledger_credits_genesis_owner() {
        let (_dir, ledger) = ledger_for("alice");

        assert_eq!(ledger.find_utxo("alice").unwrap(), vec![TxOutput::new(100, "alice")]);
        assert!(ledger.find_utxo("bob").unwrap().is_empty());

        let blocks = ledger.blocks().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_genesis());
        assert!(blocks[0].transactions[0].is_coinbase());
        assert_eq!(blocks[0].transactions[0].inputs[0].unlock_token, GENESIS_MEMO);
    }

    #[test]
    fn test_transfer_with_change() {
        let (_dir, ledger) = ledger_for("alice");
        let genesis_tx = ledger.blocks().unwrap()[0].transactions[0].clone();

        let tx = Transaction::new_transfer(&Credentials::token("alice"), "bob", 30, &ledger).unwrap();
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs, vec![TxOutput::new(30, "bob"), TxOutput::new(70, "alice")]);
        ledger.append(vec![tx]).unwrap();

        assert_eq!(total(&ledger.find_utxo("bob").unwrap()), 30);
        let alice = ledger.find_utxo("alice").unwrap();
        assert_eq!(alice, vec![TxOutput::new(70, "alice")]);

        for owner in ["alice", "bob"] {
            let unspent = ledger.find_unspent_transactions(owner).unwrap();
            assert!(unspent.iter().all(|tx| tx.id != genesis_tx.id));
        }
    }

    #[test]
    fn test_exact_transfer_has_no_change() {
        let (_dir, ledger) = ledger_for("alice");

        let tx = Transaction::new_transfer(&Credentials::token("alice"), "bob", 100, &ledger).unwrap();
        assert_eq!(tx.outputs, vec![TxOutput::new(100, "bob")]);
        ledger.append(vec![tx]).unwrap();

        assert_eq!(ledger.balance("alice").unwrap(), 0);
        assert_eq!(ledger.balance("bob").unwrap(), 100);
    }

    #[test]
    fn test_insufficient_funds_leaves_store_untouched() {
        let (_dir, ledger) = ledger_for("alice");
        let tip = ledger.last_hash();

        let result = Transaction::new_transfer(&Credentials::token("alice"), "bob", 1000, &ledger);
        assert!(matches!(
            result,
            Err(LedgerError::TransactionError(TransactionError::InsufficientFunds {
                required: 1000,
                available: 100
            }))
        ));

        assert_eq!(ledger.last_hash(), tip);
        assert_eq!(ledger.blocks().unwrap().len(), 1);
        assert_eq!(ledger.balance("alice").unwrap(), 100);
    }

    #[test]
    fn test_zero_amount_is_rejected() {
        let (_dir, ledger) = ledger_for("alice");
        let result = Transaction::new_transfer(&Credentials::token("alice"), "bob", 0, &ledger);
        assert!(matches!(
            result,
            Err(LedgerError::TransactionError(TransactionError::InvalidAmount(_)))
        ));
    }

    #[test]
    fn test_chained_transfers() {
        let (_dir, ledger) = ledger_for("alice");
        let alice = Credentials::token("alice");
        let bob = Credentials::token("bob");

        ledger.send(&alice, "bob", 30).unwrap();
        ledger.send(&alice, "carol", 50).unwrap();
        ledger.send(&bob, "carol", 10).unwrap();

        assert_eq!(ledger.balance("alice").unwrap(), 20);
        assert_eq!(ledger.balance("bob").unwrap(), 20);
        assert_eq!(ledger.balance("carol").unwrap(), 60);
        assert_eq!(ledger.validate_chain().unwrap(), 4);
    }

    #[test]
    fn test_greedy_selection_stops_when_covered() {
        let (_dir, ledger) = ledger_for("alice");
        let alice = Credentials::token("alice");

        // split alice's coins into outputs of 40 and 60
        ledger.send(&alice, "alice-savings", 40).unwrap();
        ledger.send(&Credentials::token("alice-savings"), "alice", 40).unwrap();

        let (accumulated, selection) = ledger.find_spendable_outputs("alice", 10).unwrap();
        assert!(accumulated >= 10);
        assert_eq!(selection.values().map(Vec::len).sum::<usize>(), 1);

        let (accumulated, selection) = ledger.find_spendable_outputs("alice", 100).unwrap();
        assert_eq!(accumulated, 100);
        assert_eq!(selection.values().map(Vec::len).sum::<usize>(), 2);

        let (accumulated, _) = ledger.find_spendable_outputs("alice", 500).unwrap();
        assert_eq!(accumulated, 100);
    }

    #[test]
    fn test_utxo_queries_are_idempotent() {
        let (_dir, ledger) = ledger_for("alice");
        ledger.send(&Credentials::token("alice"), "bob", 25).unwrap();

        assert_eq!(ledger.find_utxo("alice").unwrap(), ledger.find_utxo("alice").unwrap());
        assert_eq!(ledger.find_utxo("bob").unwrap(), ledger.find_utxo("bob").unwrap());
    }

    #[test]
    fn test_blocks_link_back_to_genesis() {
        let (_dir, ledger) = ledger_for("alice");
        let alice = Credentials::token("alice");
        let first = ledger.send(&alice, "bob", 10).unwrap();
        let second = ledger.send(&alice, "bob", 10).unwrap();

        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(ledger.last_hash(), second.hash);

        let blocks = ledger.blocks().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], second);
        assert_eq!(blocks[1], first);
        assert_eq!(first.prev_hash, blocks[2].hash);
        assert!(blocks[2].prev_hash.is_empty());

        for block in &blocks {
            assert!(block.verify_proof(8).unwrap());
        }
    }

    #[test]
    fn test_init_twice_fails_and_resume_sees_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let tip = {
            let ledger = Ledger::init(&config, "alice").unwrap();
            ledger.send(&Credentials::token("alice"), "bob", 30).unwrap();
            ledger.last_hash()
        };

        assert!(matches!(
            Ledger::init(&config, "alice"),
            Err(LedgerError::StorageError(StorageError::AlreadyExists(_)))
        ));

        let resumed = Ledger::resume(&config).unwrap();
        assert_eq!(resumed.last_hash(), tip);
        assert_eq!(resumed.balance("bob").unwrap(), 30);
        assert_eq!(resumed.balance("alice").unwrap(), 70);
    }

    #[test]
    fn test_resume_without_store() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Ledger::resume(&config(&dir)),
            Err(LedgerError::StorageError(StorageError::NotFound(_)))
        ));
    }

    #[test]
    fn test_append_rejects_coinbase() {
        let (_dir, ledger) = ledger_for("alice");
        let coinbase = Transaction::coinbase("mallory", "", 1_000).unwrap();

        assert!(matches!(
            ledger.append(vec![coinbase]),
            Err(LedgerError::CoinbaseOutsideGenesis(_))
        ));
        assert_eq!(ledger.balance("mallory").unwrap(), 0);
    }

    #[test]
    fn test_append_rejects_tampered_and_empty_batches() {
        let (_dir, ledger) = ledger_for("alice");
        let mut tx = Transaction::new_transfer(&Credentials::token("alice"), "bob", 30, &ledger).unwrap();
        tx.outputs[0].value = 100;

        assert!(matches!(ledger.append(vec![tx]), Err(LedgerError::InvalidBlock(_))));
        assert!(matches!(ledger.append(Vec::new()), Err(LedgerError::InvalidBlock(_))));
        assert_eq!(ledger.blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_append_rejects_unknown_or_unauthorised_inputs() {
        let (_dir, ledger) = ledger_for("alice");
        let genesis_tx = ledger.blocks().unwrap()[0].transactions[0].clone();

        let unknown = Transaction::new(
            vec![TxInput {
                ref_tx_id: vec![1; 32],
                out_index: 0,
                unlock_token: "alice".to_string(),
            }],
            vec![TxOutput::new(1, "bob")],
        )
        .unwrap();
        assert!(matches!(ledger.append(vec![unknown]), Err(LedgerError::InvalidTransaction(_))));

        let theft = Transaction::new(
            vec![TxInput {
                ref_tx_id: genesis_tx.id.clone(),
                out_index: 0,
                unlock_token: "mallory".to_string(),
            }],
            vec![TxOutput::new(100, "mallory")],
        )
        .unwrap();
        assert!(matches!(ledger.append(vec![theft]), Err(LedgerError::InvalidTransaction(_))));

        let out_of_range = Transaction::new(
            vec![TxInput {
                ref_tx_id: genesis_tx.id,
                out_index: 3,
                unlock_token: "alice".to_string(),
            }],
            vec![TxOutput::new(100, "bob")],
        )
        .unwrap();
        assert!(matches!(ledger.append(vec![out_of_range]), Err(LedgerError::InvalidTransaction(_))));

        assert_eq!(ledger.blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_append_rejects_outputs_exceeding_inputs() {
        let (_dir, ledger) = ledger_for("alice");
        let genesis_tx = ledger.blocks().unwrap()[0].transactions[0].clone();
        let spend_genesis = |outputs: Vec<TxOutput>| {
            Transaction::new(
                vec![TxInput {
                    ref_tx_id: genesis_tx.id.clone(),
                    out_index: 0,
                    unlock_token: "alice".to_string(),
                }],
                outputs,
            )
            .unwrap()
        };

        let inflated = spend_genesis(vec![TxOutput::new(1_000_000, "alice")]);
        assert!(matches!(ledger.append(vec![inflated]), Err(LedgerError::InvalidTransaction(_))));

        let overflowing = spend_genesis(vec![TxOutput::new(u64::MAX, "alice"), TxOutput::new(1, "bob")]);
        assert!(matches!(
            ledger.append(vec![overflowing]),
            Err(LedgerError::InvalidTransaction(_))
        ));

        assert_eq!(ledger.balance("alice").unwrap(), 100);
        assert_eq!(ledger.blocks().unwrap().len(), 1);

        // paying out less than the inputs is allowed
        ledger
            .append(vec![spend_genesis(vec![TxOutput::new(90, "bob")])])
            .unwrap();
        assert_eq!(ledger.balance("bob").unwrap(), 90);
        assert_eq!(ledger.balance("alice").unwrap(), 0);
    }

    #[test]
    fn test_append_rejects_spent_output() {
        let (_dir, ledger) = ledger_for("alice");
        let alice = Credentials::token("alice");

        let to_bob = Transaction::new_transfer(&alice, "bob", 100, &ledger).unwrap();
        let to_carol = Transaction::new_transfer(&alice, "carol", 100, &ledger).unwrap();

        ledger.append(vec![to_bob]).unwrap();
        assert!(matches!(
            ledger.append(vec![to_carol.clone()]),
            Err(LedgerError::InvalidTransaction(_))
        ));
        assert!(matches!(
            ledger.verify_transaction(&to_carol),
            Err(LedgerError::InvalidTransaction(_))
        ));

        assert_eq!(ledger.balance("bob").unwrap(), 100);
        assert_eq!(ledger.balance("carol").unwrap(), 0);
        assert_eq!(ledger.balance("alice").unwrap(), 0);
        assert_eq!(ledger.blocks().unwrap().len(), 2);
    }

    #[test]
    fn test_append_rejects_output_spent_twice_in_batch() {
        let (_dir, ledger) = ledger_for("alice");
        let alice = Credentials::token("alice");

        let to_bob = Transaction::new_transfer(&alice, "bob", 100, &ledger).unwrap();
        let to_carol = Transaction::new_transfer(&alice, "carol", 100, &ledger).unwrap();
        assert!(ledger.verify_transaction(&to_bob).is_ok());
        assert!(ledger.verify_transaction(&to_carol).is_ok());

        assert!(matches!(
            ledger.append(vec![to_bob.clone(), to_carol]),
            Err(LedgerError::InvalidTransaction(_))
        ));

        // the same output listed twice inside one transaction
        let mut doubled = to_bob.clone();
        doubled.inputs.push(doubled.inputs[0].clone());
        doubled.outputs = vec![TxOutput::new(200, "bob")];
        doubled.set_id().unwrap();
        assert!(matches!(ledger.append(vec![doubled]), Err(LedgerError::InvalidTransaction(_))));

        assert_eq!(ledger.blocks().unwrap().len(), 1);
        assert_eq!(ledger.balance("alice").unwrap(), 100);
        assert_eq!(ledger.balance("bob").unwrap(), 0);
        assert_eq!(ledger.balance("carol").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_appends_never_share_a_tip() {
        const WORKERS: usize = 4;

        let (_dir, ledger) = ledger_for("alice");
        let genesis_tx = ledger.blocks().unwrap()[0].transactions[0].clone();

        // give every worker an output of its own
        let split = Transaction::new(
            vec![TxInput {
                ref_tx_id: genesis_tx.id,
                out_index: 0,
                unlock_token: "alice".to_string(),
            }],
            (0..WORKERS)
                .map(|i| TxOutput::new(25, format!("worker-{i}")))
                .collect(),
        )
        .unwrap();
        ledger.append(vec![split.clone()]).unwrap();

        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..WORKERS)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let tx = Transaction::new(
                    vec![TxInput {
                        ref_tx_id: split.id.clone(),
                        out_index: i as i64,
                        unlock_token: format!("worker-{i}"),
                    }],
                    vec![TxOutput::new(25, format!("payee-{i}"))],
                )
                .unwrap();
                std::thread::spawn(move || ledger.append(vec![tx]).unwrap())
            })
            .collect();

        let mined: Vec<Block> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let prev_hashes: HashSet<Vec<u8>> = mined.iter().map(|block| block.prev_hash.clone()).collect();
        assert_eq!(prev_hashes.len(), WORKERS);

        assert_eq!(ledger.blocks().unwrap().len(), WORKERS + 2);
        assert_eq!(ledger.validate_chain().unwrap(), WORKERS + 2);
        for i in 0..WORKERS {
            assert_eq!(ledger.balance(&format!("payee-{i}")).unwrap(), 25);
        }
    }

    #[test]
    fn test_unspent_transactions_follow_block_order() {
        let (_dir, ledger) = ledger_for("alice");
        let genesis_tx = ledger.blocks().unwrap()[0].transactions[0].clone();

        let split = Transaction::new(
            vec![TxInput {
                ref_tx_id: genesis_tx.id,
                out_index: 0,
                unlock_token: "alice".to_string(),
            }],
            vec![TxOutput::new(40, "x"), TxOutput::new(60, "y")],
        )
        .unwrap();
        ledger.append(vec![split.clone()]).unwrap();

        let batch: Vec<Transaction> = [("x", 0, 40), ("y", 1, 60)]
            .into_iter()
            .map(|(owner, out_index, value)| {
                Transaction::new(
                    vec![TxInput {
                        ref_tx_id: split.id.clone(),
                        out_index,
                        unlock_token: owner.to_string(),
                    }],
                    vec![TxOutput::new(value, "carol")],
                )
                .unwrap()
            })
            .collect();
        ledger.append(batch.clone()).unwrap();

        assert_eq!(ledger.find_unspent_transactions("carol").unwrap(), batch);
        assert_eq!(
            ledger.find_utxo("carol").unwrap(),
            vec![TxOutput::new(40, "carol"), TxOutput::new(60, "carol")]
        );
        assert!(ledger.find_utxo("x").unwrap().is_empty());
    }

    #[test]
    fn test_resume_rejects_other_difficulty() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let tip = {
            let ledger = Ledger::init(&config, "alice").unwrap();
            ledger.send(&Credentials::token("alice"), "bob", 30).unwrap();
            ledger.last_hash()
        };

        let harder = LedgerConfig {
            difficulty: config.difficulty + 1,
            ..config.clone()
        };
        assert!(matches!(
            Ledger::resume(&harder),
            Err(LedgerError::DifficultyMismatch {
                stored: 8,
                configured: 9
            })
        ));

        let resumed = Ledger::resume(&config).unwrap();
        assert_eq!(resumed.last_hash(), tip);
        assert_eq!(resumed.validate_chain().unwrap(), 2);
    }

    #[test]
    fn test_failed_init_leaves_no_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);

        let invalid = LedgerConfig {
            difficulty: 0,
            ..config.clone()
        };
        assert!(Ledger::init(&invalid, "alice").is_err());
        assert!(!ChainStore::exists(&config.data_dir));
        assert!(matches!(
            Ledger::resume(&config),
            Err(LedgerError::StorageError(StorageError::NotFound(_)))
        ));

        let ledger = Ledger::init(&config, "alice").unwrap();
        assert_eq!(ledger.balance("alice").unwrap(), 100);
        assert_eq!(ledger.store.difficulty().unwrap(), Some(8));
    }

    #[test]
    fn test_find_transaction() {
        let (_dir, ledger) = ledger_for("alice");
        let block = ledger.send(&Credentials::token("alice"), "bob", 5).unwrap();
        let tx = &block.transactions[0];

        assert_eq!(ledger.find_transaction(&tx.id).unwrap().as_ref(), Some(tx));
        assert!(ledger.find_transaction(&[0; 32]).unwrap().is_none());
    }

    #[test]
    fn test_cancelled_append_writes_nothing() {
        let (_dir, ledger) = ledger_for("alice");
        let tip = ledger.last_hash();
        let tx = Transaction::new_transfer(&Credentials::token("alice"), "bob", 30, &ledger).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            ledger.append_with_cancel(vec![tx], &cancel),
            Err(LedgerError::BlockError(BlockError::MiningCancelled))
        ));
        assert_eq!(ledger.last_hash(), tip);
        assert_eq!(ledger.blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_iterator_reports_missing_block() {
        let (_dir, ledger) = ledger_for("alice");
        let orphan = Transaction::new(
            vec![TxInput {
                ref_tx_id: vec![1; 32],
                out_index: 0,
                unlock_token: "alice".to_string(),
            }],
            vec![TxOutput::new(1, "bob")],
        )
        .unwrap();
        let block = Block::create(vec![orphan], vec![0xde, 0xad], 8).unwrap();
        let encoded = block.serialize().unwrap();

        ledger
            .store
            .write_txn(|txn| -> ConflictableTransactionResult<(), LedgerError> {
                txn.set(&block.hash, &encoded)?;
                txn.set(LAST_HASH_KEY, &block.hash)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(ledger.refresh_last_hash().unwrap(), block.hash);

        let mut iter = ledger.iterator();
        assert_eq!(iter.next().unwrap().unwrap(), block);
        assert!(matches!(iter.next(), Some(Err(LedgerError::Corrupt(_)))));
        assert!(iter.next().is_none());

        assert!(matches!(ledger.find_utxo("alice"), Err(LedgerError::Corrupt(_))));
    }

    #[test]
    fn test_append_builds_on_stored_tip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let ledger = Ledger::init(&config, "alice").unwrap();
        let stale = ledger.last_hash();

        // another writer advances the tip behind this ledger's cache
        let tx = Transaction::new_transfer(&Credentials::token("alice"), "bob", 10, &ledger).unwrap();
        let external = ledger
            .store
            .write_txn(|txn| -> ConflictableTransactionResult<Block, LedgerError> {
                let tip = txn.get(LAST_HASH_KEY)?.unwrap_or_default();
                let block = Block::create(vec![tx.clone()], tip, 8).map_err(aborted)?;
                txn.set(&block.hash, &block.serialize().map_err(aborted)?)?;
                txn.set(LAST_HASH_KEY, &block.hash)?;
                Ok(block)
            })
            .unwrap();
        assert_eq!(ledger.last_hash(), stale);

        let next = Transaction::new(
            vec![TxInput {
                ref_tx_id: external.transactions[0].id.clone(),
                out_index: 0,
                unlock_token: "bob".to_string(),
            }],
            vec![TxOutput::new(10, "carol")],
        )
        .unwrap();
        let block = ledger.append(vec![next]).unwrap();

        assert_eq!(block.prev_hash, external.hash);
        assert_eq!(ledger.validate_chain().unwrap(), 3);
    }

    #[test]
    fn test_validate_chain_detects_forged_block() {
        let (_dir, ledger) = ledger_for("alice");
        let mut forged = ledger.send(&Credentials::token("alice"), "bob", 30).unwrap();
        forged.transactions[0].outputs[0].value = 90;
        forged.transactions[0].set_id().unwrap();
        let encoded = forged.serialize().unwrap();

        ledger
            .store
            .write_txn(|txn| -> ConflictableTransactionResult<(), LedgerError> {
                txn.set(&forged.hash, &encoded)?;
                Ok(())
            })
            .unwrap();

        assert!(matches!(ledger.validate_chain(), Err(LedgerError::InvalidBlock(_))));
    }

    #[test]
    fn test_parallel_mining_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig {
            parallel_mining: true,
            ..config(&dir)
        };
        let ledger = Ledger::init(&config, "alice").unwrap();
        ledger.send(&Credentials::token("alice"), "bob", 45).unwrap();

        assert_eq!(ledger.balance("bob").unwrap(), 45);
        assert_eq!(ledger.validate_chain().unwrap(), 2);
    }

    #[test]
    fn test_ed25519_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig {
            verifier: VerifierKind::Ed25519,
            ..config(&dir)
        };
        let alice = Wallet::new();
        let bob = Wallet::new();
        let ledger = Ledger::init(&config, &alice.address().0).unwrap();

        ledger.send(&alice.credentials(), &bob.address().0, 40).unwrap();
        assert_eq!(ledger.balance(&alice.address().0).unwrap(), 60);
        assert_eq!(ledger.balance(&bob.address().0).unwrap(), 40);

        // a secret that does not match the public token cannot authorise spends
        let impostor = Credentials::new(bob.address().0.clone(), alice.credentials().secret());
        assert!(matches!(
            ledger.send(&impostor, "mallory", 40),
            Err(LedgerError::InvalidTransaction(_))
        ));
        assert_eq!(ledger.balance(&bob.address().0).unwrap(), 40);
        assert_eq!(ledger.balance("mallory").unwrap(), 0);
    }
}
