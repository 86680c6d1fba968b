use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use primitive_types::U256;
use rayon::prelude::*;
use sha2::{Digest, Sha256};

use super::block::BlockError;

/// Smallest accepted difficulty (leading zero bits)
pub const MIN_DIFFICULTY: u32 = 1;

/// Largest accepted difficulty (leading zero bits)
pub const MAX_DIFFICULTY: u32 = 255;

/// Parameters controlling how blocks are mined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningParams {
    /// Number of leading zero bits the block hash must have
    pub difficulty: u32,

    /// Shard the nonce search across the rayon thread pool
    pub parallel: bool,
}

impl MiningParams {
    pub fn new(difficulty: u32) -> Self {
        MiningParams {
            difficulty,
            parallel: false,
        }
    }
}

/// Shared flag used to interrupt a running nonce search
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that every search observing this token stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Proof-of-work puzzle for a candidate block
///
/// The block hash is `SHA-256(tx_digest || prev_hash || nonce || difficulty)`
/// with both integers encoded as big-endian `u64`. A nonce solves the puzzle
/// when the hash, read as a big-endian 256-bit integer, is strictly below
/// `2^(256 - difficulty)`.
#[derive(Debug)]
pub struct ProofOfWork<'a> {
    tx_digest: &'a [u8],
    prev_hash: &'a [u8],
    difficulty: u32,
    target: U256,
}

impl<'a> ProofOfWork<'a> {
    /// Creates the puzzle for a transaction digest and predecessor hash
    ///
    /// # Returns
    ///
    /// `BlockError::InvalidDifficulty` when `difficulty` is outside
    /// `MIN_DIFFICULTY..=MAX_DIFFICULTY`
    pub fn new(tx_digest: &'a [u8], prev_hash: &'a [u8], difficulty: u32) -> Result<Self, BlockError> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&difficulty) {
            return Err(BlockError::InvalidDifficulty(difficulty));
        }

        let target = U256::one() << (256 - difficulty as usize);

        Ok(ProofOfWork {
            tx_digest,
            prev_hash,
            difficulty,
            target,
        })
    }

    pub fn target(&self) -> U256 {
        self.target
    }

    /// Computes the candidate block hash for `nonce`
    pub fn hash_with_nonce(&self, nonce: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.tx_digest);
        hasher.update(self.prev_hash);
        hasher.update(nonce.to_be_bytes());
        hasher.update(u64::from(self.difficulty).to_be_bytes());
        hasher.finalize().into()
    }

    /// Checks a digest against the target
    pub fn meets_target(&self, hash: &[u8]) -> bool {
        hash.len() == 32 && U256::from_big_endian(hash) < self.target
    }

    /// Searches nonces upward from 0 and returns the first solution
    pub fn run(&self, cancel: &CancelToken) -> Result<(u64, [u8; 32]), BlockError> {
        let mut nonce: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(BlockError::MiningCancelled);
            }

            let hash = self.hash_with_nonce(nonce);
            if self.meets_target(&hash) {
                return Ok((nonce, hash));
            }

            nonce = nonce.checked_add(1).ok_or(BlockError::NonceSpaceExhausted)?;
        }
    }

    /// Searches the nonce space on the rayon pool
    ///
    /// Any valid solution may win; which one is not deterministic.
    pub fn run_parallel(&self, cancel: &CancelToken) -> Result<(u64, [u8; 32]), BlockError> {
        let found = (0..u64::MAX).into_par_iter().find_map_any(|nonce| {
            if cancel.is_cancelled() {
                return Some(None);
            }

            let hash = self.hash_with_nonce(nonce);
            self.meets_target(&hash).then_some(Some((nonce, hash)))
        });

        match found {
            Some(Some(solution)) => Ok(solution),
            Some(None) => Err(BlockError::MiningCancelled),
            None => Err(BlockError::NonceSpaceExhausted),
        }
    }

    /// Runs the search configured by `params`
    pub fn solve(&self, params: MiningParams, cancel: &CancelToken) -> Result<(u64, [u8; 32]), BlockError> {
        if params.parallel {
            self.run_parallel(cancel)
        } else {
            self.run(cancel)
        }
    }

    /// Recomputes the hash for `nonce` and checks both the target and the claimed hash
    pub fn validate(&self, nonce: u64, claimed_hash: &[u8]) -> bool {
        let recomputed = self.hash_with_nonce(nonce);
        self.meets_target(&recomputed) && recomputed.as_slice() == claimed_hash
    }
}
