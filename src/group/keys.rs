/// Key custody boundary.
///
/// The membership engine never touches secret key material directly; every
/// signing operation and key generation goes through a `GroupKeyService`.
/// `MemoryKeyService` is the in-process implementation; deployments backed by
/// hardware keystores implement the same trait.

use std::collections::BTreeMap;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::signing::{generate_dh_keypair, generate_keypair, sign_data};
use crate::group::change::SignatureWithKey;
use crate::group::ids::{KeyId, PublicKey};

#[derive(Error, Debug)]
pub enum KeyServiceError {
    #[error("No key held for id {0}")]
    UnknownKey(KeyId),

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

// ---------------------------------------------------------------------------
// GroupKeyService
// ---------------------------------------------------------------------------

pub trait GroupKeyService {
    /// Sign `data` with the secret key behind `key_id`.
    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<SignatureWithKey, KeyServiceError>;

    /// Public half of a held Ed25519 signing key.
    fn signing_key(&self, key_id: &KeyId) -> Result<PublicKey, KeyServiceError>;

    /// Public half of a held X25519 key-agreement key.
    fn dh_key(&self, key_id: &KeyId) -> Result<PublicKey, KeyServiceError>;

    /// Generate and retain a fresh signing keypair; returns its KeyId.
    fn generate_signing_key(&mut self) -> Result<KeyId, KeyServiceError>;

    /// Generate and retain a fresh key-agreement keypair; returns its KeyId.
    fn generate_dh_key(&mut self) -> Result<KeyId, KeyServiceError>;
}

// ---------------------------------------------------------------------------
// MemoryKeyService
// ---------------------------------------------------------------------------

/// Secret key bytes, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretKey([u8; 32]);

struct KeyEntry {
    public: PublicKey,
    secret: SecretKey,
}

/// In-memory key store. Keys are indexed by the KeyId of their public half.
#[derive(Default)]
pub struct MemoryKeyService {
    signing: BTreeMap<KeyId, KeyEntry>,
    agreement: BTreeMap<KeyId, KeyEntry>,
}

impl MemoryKeyService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupKeyService for MemoryKeyService {
    fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<SignatureWithKey, KeyServiceError> {
        let entry = self
            .signing
            .get(key_id)
            .ok_or(KeyServiceError::UnknownKey(*key_id))?;
        let signature = sign_data(data, &entry.secret.0)
            .map_err(|e| KeyServiceError::SigningFailed(e.to_string()))?;
        Ok(SignatureWithKey {
            key_id: *key_id,
            signature,
        })
    }

    fn signing_key(&self, key_id: &KeyId) -> Result<PublicKey, KeyServiceError> {
        self.signing
            .get(key_id)
            .map(|entry| entry.public)
            .ok_or(KeyServiceError::UnknownKey(*key_id))
    }

    fn dh_key(&self, key_id: &KeyId) -> Result<PublicKey, KeyServiceError> {
        self.agreement
            .get(key_id)
            .map(|entry| entry.public)
            .ok_or(KeyServiceError::UnknownKey(*key_id))
    }

    fn generate_signing_key(&mut self) -> Result<KeyId, KeyServiceError> {
        let (public, secret) = generate_keypair();
        let key_id = KeyId::from_public_key(&public);
        self.signing.insert(
            key_id,
            KeyEntry {
                public,
                secret: SecretKey(secret),
            },
        );
        Ok(key_id)
    }

    fn generate_dh_key(&mut self) -> Result<KeyId, KeyServiceError> {
        let (public, secret) = generate_dh_keypair();
        let key_id = KeyId::from_public_key(&public);
        self.agreement.insert(
            key_id,
            KeyEntry {
                public,
                secret: SecretKey(secret),
            },
        );
        Ok(key_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
