/// Replica-to-replica block exchange.
///
/// Synchronization is push-based and stateless: a replica periodically sends
/// a peer its heads plus its blocks in causal order, and the receiver inserts
/// whatever it is missing. Senders are authenticated out of band; the
/// `MemberService` maps block origins to the public keys the transport
/// authenticated them with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::dag::block::{Block, BlockId};
use crate::group::ids::{KeyId, PublicKey};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Bincode serialization failed: {0}")]
    BincodeError(String),
}

// ---------------------------------------------------------------------------
// BlockSyncMessage
// ---------------------------------------------------------------------------

/// One gossip round: the sender's heads and every block it holds, ordered so
/// the receiver can insert front to back without dependency stalls.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockSyncMessage {
    pub heads: Vec<BlockId>,
    pub blocks: Vec<Block>,
}

impl BlockSyncMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        bincode::serialize(self).map_err(|e| SyncError::BincodeError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        bincode::deserialize(bytes).map_err(|e| SyncError::BincodeError(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MemberService
// ---------------------------------------------------------------------------

/// Transport-level identity directory: which signer ids are acceptable block
/// origins, and the key each one authenticates with.
pub trait MemberService {
    /// Every signer id the transport will accept blocks from.
    fn members(&self) -> Vec<KeyId>;

    fn member_key(&self, id: &KeyId) -> Option<PublicKey>;

    fn is_known(&self, id: &KeyId) -> bool {
        self.member_key(id).is_some()
    }
}

/// In-memory directory for tests and single-process deployments.
#[derive(Default, Clone)]
pub struct MemoryMemberService {
    keys: BTreeMap<KeyId, PublicKey>,
}

impl MemoryMemberService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a public key; its KeyId becomes an acceptable origin.
    pub fn register(&mut self, key: PublicKey) -> KeyId {
        let id = KeyId::from_public_key(&key);
        self.keys.insert(id, key);
        id
    }
}

impl MemberService for MemoryMemberService {
    fn members(&self) -> Vec<KeyId> {
        self.keys.keys().copied().collect()
    }

    fn member_key(&self, id: &KeyId) -> Option<PublicKey> {
        self.keys.get(id).copied()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
