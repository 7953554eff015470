/// Content-addressed DAG blocks.
///
/// A block carries one opaque payload from one origin and points at the DAG
/// positions it causally follows. The block id is a BLAKE3 hash of the
/// block's canonical bytes, so identical blocks converge on the same id on
/// every replica.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::crypto::hashing::content_hash;
use crate::group::ids::KeyId;
use crate::group::member::put_prefixed;

// ---------------------------------------------------------------------------
// BlockId
// ---------------------------------------------------------------------------

/// 32-byte content hash identifying a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub [u8; 32]);

impl BlockId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// KeyId of the replica that authored the block.
    pub origin: KeyId,
    /// Opaque application payload. Empty for root markers.
    pub payload: Vec<u8>,
    /// Ids of the blocks this one causally extends. Empty only for roots.
    pub predecessors: BTreeSet<BlockId>,
    /// Root markers anchor the DAG and carry no payload.
    pub is_root: bool,
}

impl Block {
    /// A root marker for `origin`'s DAG.
    pub fn root(origin: KeyId) -> Self {
        Block {
            origin,
            payload: Vec::new(),
            predecessors: BTreeSet::new(),
            is_root: true,
        }
    }

    /// A payload block extending `predecessors`.
    pub fn new(origin: KeyId, payload: Vec<u8>, predecessors: BTreeSet<BlockId>) -> Self {
        Block {
            origin,
            payload,
            predecessors,
            is_root: false,
        }
    }

    /// Content-derived id. Computed over a manual canonical encoding, so the
    /// id is stable regardless of the wire codec the block travelled in.
    pub fn id(&self) -> BlockId {
        let mut bytes = Vec::with_capacity(64 + self.payload.len());
        bytes.extend_from_slice(self.origin.as_bytes());
        put_prefixed(&mut bytes, &self.payload);
        bytes.extend_from_slice(&(self.predecessors.len() as u64).to_le_bytes());
        for pred in &self.predecessors {
            bytes.extend_from_slice(pred.as_bytes());
        }
        bytes.push(self.is_root as u8);
        BlockId(content_hash(&bytes))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
