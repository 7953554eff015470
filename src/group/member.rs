/// Per-member membership record.
///
/// A `GroupMemberInfo` is an immutable value describing one member's current
/// standing in the group: identity keys, role, sponsor, routing address, and
/// the member's retired signing keys. Updates produce a new value; nothing is
/// mutated in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::group::ids::{KeyId, PublicKey};

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Member role. Admins authorize membership changes; ordinary members may
/// only perform self-service updates (key rotation, address change).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Role {
    Admin = 0,
    Ordinary = 1,
}

// ---------------------------------------------------------------------------
// HistoricKey
// ---------------------------------------------------------------------------

/// A retired signing key and its validity window. `historic_keys` only grows;
/// existing entries are never rewritten.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoricKey {
    pub key: PublicKey,
    /// Milliseconds since the Unix epoch.
    pub valid_from: i64,
    pub valid_until: i64,
}

// ---------------------------------------------------------------------------
// GroupMemberInfo
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GroupMemberInfo {
    /// Unique within the group.
    pub member_name: String,
    /// Current Ed25519 signing public key.
    pub member_key: PublicKey,
    /// When `member_key` was issued, milliseconds since the Unix epoch.
    pub key_issued: i64,
    /// Epoch at which the member's current status was set. Lower means the
    /// status was granted earlier — the seniority metric for conflict
    /// resolution.
    pub issue_epoch: i64,
    /// KeyId of the admin who authorized the current status.
    pub sponsor: KeyId,
    pub role: Role,
    /// Free-form member metadata. BTreeMap keeps hashing deterministic.
    pub other_info: BTreeMap<String, String>,
    /// Retired signing keys, append-only.
    pub historic_keys: Vec<HistoricKey>,
    /// Current X25519 key-agreement public key.
    pub group_dh_key: PublicKey,
    /// Opaque routing address hash.
    pub routing_address: [u8; 32],
}

impl GroupMemberInfo {
    /// Derived key identity of the current signing key.
    pub fn member_key_id(&self) -> KeyId {
        KeyId::from_public_key(&self.member_key)
    }

    /// Whether the member currently holds the Admin role.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// All signing keys this member has ever held: historic first, current last.
    pub fn all_signing_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.historic_keys
            .iter()
            .map(|h| &h.key)
            .chain(std::iter::once(&self.member_key))
    }

    /// Canonical bytes for hashing — the Merkle leaf for this member.
    ///
    /// Manual encoding with length prefixes on variable-size fields; the
    /// `other_info` map iterates sorted, so two equal members always produce
    /// identical bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_prefixed(&mut out, self.member_name.as_bytes());
        out.extend_from_slice(&self.member_key);
        out.extend_from_slice(&self.key_issued.to_le_bytes());
        out.extend_from_slice(&self.issue_epoch.to_le_bytes());
        out.extend_from_slice(self.sponsor.as_bytes());
        out.push(self.role as u8);
        out.extend_from_slice(&(self.other_info.len() as u64).to_le_bytes());
        for (key, value) in &self.other_info {
            put_prefixed(&mut out, key.as_bytes());
            put_prefixed(&mut out, value.as_bytes());
        }
        out.extend_from_slice(&(self.historic_keys.len() as u64).to_le_bytes());
        for historic in &self.historic_keys {
            out.extend_from_slice(&historic.key);
            out.extend_from_slice(&historic.valid_from.to_le_bytes());
            out.extend_from_slice(&historic.valid_until.to_le_bytes());
        }
        out.extend_from_slice(&self.group_dh_key);
        out.extend_from_slice(&self.routing_address);
        out
    }
}

/// Append a length-prefixed byte string.
pub(crate) fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(bytes);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
