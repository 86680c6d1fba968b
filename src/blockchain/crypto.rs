use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Capability deciding who may spend an output
///
/// `public` is the token outputs are locked to, `secret` is what the spender
/// holds and `proof` is what ends up in an input's `unlock_token`.
pub trait OwnershipVerifier: fmt::Debug + Send + Sync {
    /// Produces the proof authorising `payload`
    fn sign(&self, secret: &str, payload: &[u8]) -> Result<String, CryptoError>;

    /// Checks `proof` against the owner's public token
    fn verify(&self, public: &str, payload: &[u8], proof: &str) -> bool;
}

/// Placeholder verifier: the proof is the token itself
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenVerifier;

impl OwnershipVerifier for TokenVerifier {
    fn sign(&self, secret: &str, _payload: &[u8]) -> Result<String, CryptoError> {
        Ok(secret.to_string())
    }

    fn verify(&self, public: &str, _payload: &[u8], proof: &str) -> bool {
        public == proof
    }
}

/// Ed25519 verifier over base58 addresses and hex secret keys
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl OwnershipVerifier for Ed25519Verifier {
    fn sign(&self, secret: &str, payload: &[u8]) -> Result<String, CryptoError> {
        let secret_bytes = hex::decode(secret)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        let wallet = Wallet::from_secret_key(&secret_bytes)?;
        Ok(wallet.sign(payload).0)
    }

    fn verify(&self, public: &str, payload: &[u8], proof: &str) -> bool {
        let Ok(public_key) = Address(public.to_string()).to_public_key() else {
            return false;
        };
        let Ok(signature) = DigitalSignature(proof.to_string()).to_signature() else {
            return false;
        };
        public_key.verify(payload, &signature).is_ok()
    }
}

/// The pair a spender presents: the token its outputs are locked to and
/// the secret used to produce unlock proofs
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub public: String,
    secret: String,
}

impl Credentials {
    pub fn new(public: impl Into<String>, secret: impl Into<String>) -> Self {
        Credentials {
            public: public.into(),
            secret: secret.into(),
        }
    }

    /// Credentials for the token verifier, where public and secret coincide
    pub fn token(token: impl Into<String>) -> Self {
        let token = token.into();
        Credentials {
            public: token.clone(),
            secret: token,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Represents a wallet address (public key in base58 format)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates a new address from a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        Address(bs58::encode(public_key.as_bytes()).into_string())
    }

    /// Converts the address to a public key
    pub fn to_public_key(&self) -> Result<VerifyingKey, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey("Invalid public key length".to_string())
        })?;

        VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents a digital signature (base58 encoded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(bs58::encode(signature.to_bytes()).into_string())
    }

    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let signature_bytes: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidSignature("Invalid signature length".to_string())
        })?;

        Ok(Signature::from_bytes(&signature_bytes))
    }
}

/// Ed25519 keypair usable with [`Ed25519Verifier`]
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    address: Address,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = Address::from_public_key(&signing_key.verifying_key());

        Wallet { signing_key, address }
    }

    /// Creates a wallet from an existing 32-byte secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        let signing_key = SigningKey::from_bytes(&bytes_array);
        let address = Address::from_public_key(&signing_key.verifying_key());

        Ok(Wallet { signing_key, address })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn sign(&self, message: &[u8]) -> DigitalSignature {
        DigitalSignature::from_signature(&self.signing_key.sign(message))
    }

    /// Credentials for spending this wallet's outputs
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.address.0.clone(), hex::encode(self.signing_key.to_bytes()))
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}
