/// Immutable group membership snapshot.
///
/// A `GroupInfo` is a value object: every applied change produces a new
/// snapshot with `epoch + 1` and `prev_group_state_hash` pointing at the
/// snapshot it replaced. The Merkle-root `group_state_hash` is the
/// authenticated fingerprint changes and merges reference.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::hashing::merkle_root;
use crate::group::ids::{GroupId, KeyId, PublicKey, StateHash};
use crate::group::member::{put_prefixed, GroupMemberInfo};

/// Epoch of the sentinel snapshot that precedes any Create.
pub const EMPTY_EPOCH: i64 = -1;

// ---------------------------------------------------------------------------
// GroupInfo
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    /// Immutable group identity, set at creation.
    pub group_id: GroupId,
    /// Human-readable label.
    pub group_identifier: String,
    /// Monotonically increasing, +1 per applied non-merge change. −1 for the
    /// empty sentinel.
    pub epoch: i64,
    /// Ordered member list. Names, keys, DH keys, and routing addresses are
    /// unique across it.
    pub members: Vec<GroupMemberInfo>,
    /// Group-level metadata. BTreeMap keeps hashing deterministic.
    pub group_info: BTreeMap<String, String>,
    /// State hash of the snapshot immediately prior.
    pub prev_group_state_hash: StateHash,
}

impl GroupInfo {
    /// The sentinel value before any Create has been applied.
    pub fn empty() -> Self {
        GroupInfo {
            group_id: GroupId::from_bytes([0u8; 32]),
            group_identifier: String::new(),
            epoch: EMPTY_EPOCH,
            members: Vec::new(),
            group_info: BTreeMap::new(),
            prev_group_state_hash: [0u8; 32],
        }
    }

    /// Whether this is the pre-creation sentinel.
    pub fn is_empty_group(&self) -> bool {
        self.epoch == EMPTY_EPOCH
    }

    // -----------------------------------------------------------------------
    // Fingerprint
    // -----------------------------------------------------------------------

    /// Merkle-root fingerprint of this snapshot.
    ///
    /// Leaves are the canonical bytes of each member in list order, followed
    /// by the canonical bytes of the group-level fields (everything except
    /// the members themselves).
    pub fn group_state_hash(&self) -> StateHash {
        let mut leaves: Vec<Vec<u8>> = self
            .members
            .iter()
            .map(|member| member.canonical_bytes())
            .collect();
        leaves.push(self.group_level_bytes());
        merkle_root(&leaves)
    }

    /// Canonical bytes of the snapshot with the member list cleared.
    fn group_level_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.group_id.as_bytes());
        put_prefixed(&mut out, self.group_identifier.as_bytes());
        out.extend_from_slice(&self.epoch.to_le_bytes());
        out.extend_from_slice(&(self.group_info.len() as u64).to_le_bytes());
        for (key, value) in &self.group_info {
            put_prefixed(&mut out, key.as_bytes());
            put_prefixed(&mut out, value.as_bytes());
        }
        out.extend_from_slice(&self.prev_group_state_hash);
        out
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Find a member by the KeyId of their current signing key.
    pub fn member_by_key_id(&self, key_id: &KeyId) -> Option<&GroupMemberInfo> {
        self.members.iter().find(|m| m.member_key_id() == *key_id)
    }

    /// Find a member by name.
    pub fn member_by_name(&self, name: &str) -> Option<&GroupMemberInfo> {
        self.members.iter().find(|m| m.member_name == name)
    }

    /// Count of members holding the Admin role.
    pub fn admin_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_admin()).count()
    }

    /// Whether a signing key collides with any current or historic key.
    pub fn signing_key_in_use(&self, key: &PublicKey) -> bool {
        self.members
            .iter()
            .any(|m| m.all_signing_keys().any(|k| k == key))
    }

    /// Whether a DH key collides with any member's current DH key.
    pub fn dh_key_in_use(&self, key: &PublicKey) -> bool {
        self.members.iter().any(|m| m.group_dh_key == *key)
    }

    /// Whether a routing address collides with any member's current address.
    pub fn address_in_use(&self, address: &[u8; 32]) -> bool {
        self.members.iter().any(|m| m.routing_address == *address)
    }

    // -----------------------------------------------------------------------
    // Functional update
    // -----------------------------------------------------------------------

    /// Start the snapshot that succeeds this one: epoch bumped by exactly 1,
    /// `prev_group_state_hash` set to this snapshot's fingerprint. The caller
    /// then edits members / metadata on the returned value.
    pub fn successor(&self) -> GroupInfo {
        let mut next = self.clone();
        next.prev_group_state_hash = self.group_state_hash();
        next.epoch = self.epoch + 1;
        next
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
