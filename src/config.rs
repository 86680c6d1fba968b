//! Ledger configuration.
//!
//! Values start from [`LedgerConfig::default`], can be replaced by a JSON
//! file and are finally overridden by `LEDGER_*` environment variables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blockchain::crypto::{Ed25519Verifier, OwnershipVerifier, TokenVerifier};
use crate::blockchain::proof::{MiningParams, MAX_DIFFICULTY, MIN_DIFFICULTY};

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Difficulty {0} out of range 1..=255")]
    InvalidDifficulty(u32),
}

/// Which ownership check guards spends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    /// Owner tokens double as unlock proofs
    #[default]
    Token,

    /// Base58 ed25519 addresses and signatures
    Ed25519,
}

impl VerifierKind {
    pub fn build(self) -> Arc<dyn OwnershipVerifier> {
        match self {
            VerifierKind::Token => Arc::new(TokenVerifier),
            VerifierKind::Ed25519 => Arc::new(Ed25519Verifier),
        }
    }
}

impl fmt::Display for VerifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierKind::Token => write!(f, "token"),
            VerifierKind::Ed25519 => write!(f, "ed25519"),
        }
    }
}

impl FromStr for VerifierKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token" => Ok(VerifierKind::Token),
            "ed25519" => Ok(VerifierKind::Ed25519),
            _ => Err(ConfigError::InvalidValue {
                key: "verifier".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Settings for opening and extending a ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory of the backing store
    pub data_dir: PathBuf,

    /// Leading zero bits required of block hashes
    pub difficulty: u32,

    /// Value issued by the genesis coinbase
    pub reward: u64,

    /// Token credited by the genesis block when the binary creates a ledger
    pub genesis_owner: String,

    /// Shard the nonce search across threads
    pub parallel_mining: bool,

    pub verifier: VerifierKind,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            data_dir: PathBuf::from("./tmp/blocks"),
            difficulty: 12,
            reward: 100,
            genesis_owner: "genesis".to_string(),
            parallel_mining: false,
            verifier: VerifierKind::Token,
        }
    }
}

impl LedgerConfig {
    /// Loads defaults, then `path` if given, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file; missing fields keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Applies `LEDGER_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(value) = lookup("LEDGER_DIFFICULTY") {
            self.difficulty = parse_value("LEDGER_DIFFICULTY", &value)?;
        }
        if let Some(value) = lookup("LEDGER_REWARD") {
            self.reward = parse_value("LEDGER_REWARD", &value)?;
        }
        if let Some(owner) = lookup("LEDGER_GENESIS_OWNER") {
            self.genesis_owner = owner;
        }
        if let Some(value) = lookup("LEDGER_PARALLEL_MINING") {
            self.parallel_mining = parse_value("LEDGER_PARALLEL_MINING", &value)?;
        }
        if let Some(value) = lookup("LEDGER_VERIFIER") {
            self.verifier = value.parse()?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&self.difficulty) {
            return Err(ConfigError::InvalidDifficulty(self.difficulty));
        }
        Ok(())
    }

    pub fn mining_params(&self) -> MiningParams {
        MiningParams {
            difficulty: self.difficulty,
            parallel: self.parallel_mining,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
