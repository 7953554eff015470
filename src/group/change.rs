/// Group membership change operations.
///
/// Every mutation of the group record is a self-describing, independently
/// serializable `GroupChange`. Changes are immutable and signed: the change
/// is constructed with a placeholder signature, the canonical bytes of that
/// blanked form are signed, and the real signature is substituted in.
/// `verify` re-blanks the signature field before checking, so the signature
/// never signs over itself.
///
/// - Canonical signable bytes: bincode (deterministic, field order fixed)
/// - Wire encoding: CBOR via ciborium
/// - Signing: Ed25519

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::crypto::signing::verify_signature;
use crate::group::ids::{GroupId, KeyId, PublicKey, StateHash};
use crate::group::info::GroupInfo;
use crate::group::keys::GroupKeyService;
use crate::group::member::{GroupMemberInfo, HistoricKey, Role};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ChangeError {
    #[error("Group already created")]
    GroupAlreadyCreated,

    #[error("Founder must hold the Admin role")]
    FounderNotAdmin,

    #[error("Sponsor not found in group")]
    SponsorNotFound,

    #[error("Sponsor does not hold the Admin role")]
    SponsorNotAdmin,

    #[error("Member not found: {0}")]
    MemberNotFound(KeyId),

    #[error("Signer does not match the expected actor")]
    SignerMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Member name already taken: {0}")]
    DuplicateName(String),

    #[error("Signing key collides with a current or historic key")]
    DuplicateSigningKey,

    #[error("DH key collides with an existing member key")]
    DuplicateDhKey,

    #[error("Routing address already in use")]
    DuplicateAddress,

    #[error("New member must not carry historic keys")]
    HistoricKeysNotEmpty,

    #[error("Removal would leave the group without an Admin")]
    LastAdmin,

    #[error("Junior admin may not override a senior admin")]
    SeniorityViolation,

    #[error("Declared old address does not match current state")]
    StaleAddress,

    #[error("Rotation time must be strictly after the previous key issue time")]
    RotationNotAfterIssue,

    #[error("Rotation must replace exactly one of signing key or DH key")]
    InvalidRotation,

    #[error("Signing key rotation requires a new-key signature")]
    MissingNewKeySignature,

    #[error("Merge must reference at least two state hashes")]
    TooFewMergeHashes,

    #[error("Merge changes are folded by the reconciliation engine, not applied")]
    MergeNotApplicable,

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Bincode serialization failed: {0}")]
    BincodeError(String),

    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),
}

// ---------------------------------------------------------------------------
// SignatureWithKey
// ---------------------------------------------------------------------------

/// An Ed25519 signature paired with the id of the key that produced it.
///
/// The `key_id` stays in place when the signature bytes are blanked for
/// signing, so the signer identity is itself covered by the signature.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SignatureWithKey {
    pub key_id: KeyId,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl SignatureWithKey {
    /// A zeroed signature carrying the signer identity — the form that gets
    /// serialized for signing.
    pub fn placeholder(key_id: KeyId) -> Self {
        SignatureWithKey {
            key_id,
            signature: [0u8; 64],
        }
    }
}

impl std::fmt::Debug for SignatureWithKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureWithKey({})", self.key_id)
    }
}

// ---------------------------------------------------------------------------
// GroupChange
// ---------------------------------------------------------------------------

/// The closed set of membership operations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum GroupChange {
    /// Establishes the group: id, label, metadata, and the founding admin.
    Create {
        group_id: GroupId,
        group_identifier: String,
        group_info: BTreeMap<String, String>,
        founder: GroupMemberInfo,
        signature: SignatureWithKey,
    },

    /// Adds a member under sponsor authorization.
    MemberAdd {
        new_info: GroupMemberInfo,
        signature: SignatureWithKey,
    },

    /// Removes a member. The sponsor rotates their own DH key in the same
    /// change to preserve forward secrecy, and inherits the removed member's
    /// sponsees.
    MemberRemove {
        member_key_id: KeyId,
        new_sponsor_dh_key: PublicKey,
        signature: SignatureWithKey,
    },

    /// Replaces the group-level metadata map.
    Modify {
        new_group_info: BTreeMap<String, String>,
        signature: SignatureWithKey,
    },

    /// Changes a member's role and/or free-form info.
    AdminChange {
        member_key_id: KeyId,
        new_role: Role,
        new_other_info: BTreeMap<String, String>,
        signature: SignatureWithKey,
    },

    /// Self-service rotation of the member's signing key or DH key.
    /// A signing-key rotation carries a second signature made with the new
    /// key, proving possession of both.
    KeyRotate {
        member_key_id: KeyId,
        new_key: Option<PublicKey>,
        new_dh_key: Option<PublicKey>,
        /// Milliseconds since the Unix epoch; strictly after `key_issued`.
        rotated_at: i64,
        signature: SignatureWithKey,
        new_key_signature: Option<SignatureWithKey>,
    },

    /// Self-service update of the routing address. The declared old address
    /// is an optimistic-concurrency guard.
    AddressChange {
        member_key_id: KeyId,
        old_address: [u8; 32],
        new_address: [u8; 32],
        signature: SignatureWithKey,
    },

    /// Marker unifying divergent branches. Carries no member mutation; the
    /// reconciliation engine consumes it specially.
    Merge {
        previous_group_info_hashes: BTreeSet<StateHash>,
        signature: SignatureWithKey,
    },
}

impl GroupChange {
    /// KeyId of the actor that signed (and authorized) this change.
    pub fn sponsor_key_id(&self) -> KeyId {
        match self {
            GroupChange::Create { signature, .. }
            | GroupChange::MemberAdd { signature, .. }
            | GroupChange::MemberRemove { signature, .. }
            | GroupChange::Modify { signature, .. }
            | GroupChange::AdminChange { signature, .. }
            | GroupChange::KeyRotate { signature, .. }
            | GroupChange::AddressChange { signature, .. }
            | GroupChange::Merge { signature, .. } => signature.key_id,
        }
    }

    /// Variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            GroupChange::Create { .. } => "Create",
            GroupChange::MemberAdd { .. } => "MemberAdd",
            GroupChange::MemberRemove { .. } => "MemberRemove",
            GroupChange::Modify { .. } => "Modify",
            GroupChange::AdminChange { .. } => "AdminChange",
            GroupChange::KeyRotate { .. } => "KeyRotate",
            GroupChange::AddressChange { .. } => "AddressChange",
            GroupChange::Merge { .. } => "Merge",
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, GroupChange::Create { .. })
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, GroupChange::Merge { .. })
    }

    // -----------------------------------------------------------------------
    // Signing
    // -----------------------------------------------------------------------

    /// Copy of this change with every signature's bytes zeroed; key ids stay.
    fn blanked(&self) -> GroupChange {
        let mut blank = self.clone();
        match &mut blank {
            GroupChange::Create { signature, .. }
            | GroupChange::MemberAdd { signature, .. }
            | GroupChange::MemberRemove { signature, .. }
            | GroupChange::Modify { signature, .. }
            | GroupChange::AdminChange { signature, .. }
            | GroupChange::AddressChange { signature, .. }
            | GroupChange::Merge { signature, .. } => signature.signature = [0u8; 64],
            GroupChange::KeyRotate {
                signature,
                new_key_signature,
                ..
            } => {
                signature.signature = [0u8; 64];
                if let Some(extra) = new_key_signature {
                    extra.signature = [0u8; 64];
                }
            }
        }
        blank
    }

    /// Canonical bytes to sign/verify: bincode of the blanked change.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, ChangeError> {
        bincode::serialize(&self.blanked()).map_err(|e| ChangeError::BincodeError(e.to_string()))
    }

    /// Sign this change in place through the key service.
    ///
    /// The primary signature is made with the key id already carried in the
    /// placeholder; a `KeyRotate` with a new-key placeholder also gets its
    /// possession-proof signature. Both signatures cover the same blanked
    /// bytes.
    pub fn sign<K: GroupKeyService + ?Sized>(&mut self, keys: &K) -> Result<(), ChangeError> {
        let bytes = self.signable_bytes()?;
        let primary = keys
            .sign(&self.sponsor_key_id(), &bytes)
            .map_err(|e| ChangeError::SigningFailed(e.to_string()))?;

        match self {
            GroupChange::Create { signature, .. }
            | GroupChange::MemberAdd { signature, .. }
            | GroupChange::MemberRemove { signature, .. }
            | GroupChange::Modify { signature, .. }
            | GroupChange::AdminChange { signature, .. }
            | GroupChange::AddressChange { signature, .. }
            | GroupChange::Merge { signature, .. } => *signature = primary,
            GroupChange::KeyRotate {
                signature,
                new_key_signature,
                ..
            } => {
                *signature = primary;
                if let Some(extra) = new_key_signature {
                    *extra = keys
                        .sign(&extra.key_id, &bytes)
                        .map_err(|e| ChangeError::SigningFailed(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn check_signature(
        &self,
        sig: &SignatureWithKey,
        public_key: &PublicKey,
    ) -> Result<(), ChangeError> {
        let bytes = self.signable_bytes()?;
        let valid = verify_signature(&bytes, &sig.signature, public_key)
            .map_err(|_| ChangeError::InvalidSignature)?;
        if valid {
            Ok(())
        } else {
            Err(ChangeError::InvalidSignature)
        }
    }

    // -----------------------------------------------------------------------
    // Wire codec
    // -----------------------------------------------------------------------

    /// CBOR-encode for block payloads. Signatures are computed over the
    /// canonical bincode form, so the wire encoding round-trips bit-exactly
    /// back into a verifiable change.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChangeError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ChangeError::CborEncode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from block payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChangeError> {
        ciborium::from_reader(bytes).map_err(|e| ChangeError::CborDecode(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Verify
    // -----------------------------------------------------------------------

    /// Check this change against the snapshot it would transition.
    ///
    /// Structural preconditions and signature checks only — `verify` never
    /// mutates anything and must be called before `apply`.
    pub fn verify(&self, state: &GroupInfo) -> Result<(), ChangeError> {
        match self {
            GroupChange::Create {
                founder, signature, ..
            } => {
                if !state.is_empty_group() {
                    return Err(ChangeError::GroupAlreadyCreated);
                }
                if founder.role != Role::Admin {
                    return Err(ChangeError::FounderNotAdmin);
                }
                if !founder.historic_keys.is_empty() {
                    return Err(ChangeError::HistoricKeysNotEmpty);
                }
                if signature.key_id != founder.member_key_id() {
                    return Err(ChangeError::SignerMismatch);
                }
                self.check_signature(signature, &founder.member_key)
            }

            GroupChange::MemberAdd {
                new_info,
                signature,
            } => {
                let sponsor = self.admin_sponsor(state)?;
                self.check_signature(signature, &sponsor.member_key)?;
                if state.member_by_name(&new_info.member_name).is_some() {
                    return Err(ChangeError::DuplicateName(new_info.member_name.clone()));
                }
                if state.signing_key_in_use(&new_info.member_key) {
                    return Err(ChangeError::DuplicateSigningKey);
                }
                if state.dh_key_in_use(&new_info.group_dh_key) {
                    return Err(ChangeError::DuplicateDhKey);
                }
                if state.address_in_use(&new_info.routing_address) {
                    return Err(ChangeError::DuplicateAddress);
                }
                if !new_info.historic_keys.is_empty() {
                    return Err(ChangeError::HistoricKeysNotEmpty);
                }
                Ok(())
            }

            GroupChange::MemberRemove {
                member_key_id,
                new_sponsor_dh_key,
                signature,
            } => {
                let sponsor = self.admin_sponsor(state)?;
                self.check_signature(signature, &sponsor.member_key)?;
                let target = state
                    .member_by_key_id(member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                if target.is_admin() && state.admin_count() <= 1 {
                    return Err(ChangeError::LastAdmin);
                }
                let collides = state.members.iter().any(|m| {
                    m.member_key_id() != signature.key_id && m.group_dh_key == *new_sponsor_dh_key
                });
                if collides {
                    return Err(ChangeError::DuplicateDhKey);
                }
                Ok(())
            }

            GroupChange::Modify { signature, .. } => {
                let sponsor = self.admin_sponsor(state)?;
                self.check_signature(signature, &sponsor.member_key)
            }

            GroupChange::AdminChange {
                member_key_id,
                new_role,
                signature,
                ..
            } => {
                let sponsor = self.admin_sponsor(state)?;
                self.check_signature(signature, &sponsor.member_key)?;
                let member = state
                    .member_by_key_id(member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                // A junior admin (granted status later, higher issue_epoch)
                // may not override a senior one, unless self-targeted.
                if sponsor.issue_epoch >= member.issue_epoch && signature.key_id != *member_key_id
                {
                    return Err(ChangeError::SeniorityViolation);
                }
                if member.is_admin() && *new_role != Role::Admin && state.admin_count() <= 1 {
                    return Err(ChangeError::LastAdmin);
                }
                Ok(())
            }

            GroupChange::KeyRotate {
                member_key_id,
                new_key,
                new_dh_key,
                rotated_at,
                signature,
                new_key_signature,
            } => {
                let member = state
                    .member_by_key_id(member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                if signature.key_id != *member_key_id {
                    return Err(ChangeError::SignerMismatch);
                }
                if new_key.is_some() == new_dh_key.is_some() {
                    return Err(ChangeError::InvalidRotation);
                }
                if *rotated_at <= member.key_issued {
                    return Err(ChangeError::RotationNotAfterIssue);
                }
                self.check_signature(signature, &member.member_key)?;

                if let Some(key) = new_key {
                    let extra = new_key_signature
                        .as_ref()
                        .ok_or(ChangeError::MissingNewKeySignature)?;
                    if extra.key_id != KeyId::from_public_key(key) {
                        return Err(ChangeError::SignerMismatch);
                    }
                    self.check_signature(extra, key)?;
                    if state.signing_key_in_use(key) {
                        return Err(ChangeError::DuplicateSigningKey);
                    }
                }
                if let Some(dh) = new_dh_key {
                    let collides = state
                        .members
                        .iter()
                        .any(|m| m.member_key_id() != *member_key_id && m.group_dh_key == *dh);
                    if collides {
                        return Err(ChangeError::DuplicateDhKey);
                    }
                }
                Ok(())
            }

            GroupChange::AddressChange {
                member_key_id,
                old_address,
                new_address,
                signature,
            } => {
                let member = state
                    .member_by_key_id(member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                if signature.key_id != *member_key_id {
                    return Err(ChangeError::SignerMismatch);
                }
                self.check_signature(signature, &member.member_key)?;
                if member.routing_address != *old_address {
                    return Err(ChangeError::StaleAddress);
                }
                let collides = state.members.iter().any(|m| {
                    m.member_key_id() != *member_key_id && m.routing_address == *new_address
                });
                if collides {
                    return Err(ChangeError::DuplicateAddress);
                }
                Ok(())
            }

            GroupChange::Merge {
                previous_group_info_hashes,
                signature,
            } => {
                if previous_group_info_hashes.len() < 2 {
                    return Err(ChangeError::TooFewMergeHashes);
                }
                let sponsor = state
                    .member_by_key_id(&signature.key_id)
                    .ok_or(ChangeError::SponsorNotFound)?;
                self.check_signature(signature, &sponsor.member_key)
            }
        }
    }

    /// Sponsor lookup shared by the admin-authorized variants.
    fn admin_sponsor<'a>(&self, state: &'a GroupInfo) -> Result<&'a GroupMemberInfo, ChangeError> {
        let sponsor = state
            .member_by_key_id(&self.sponsor_key_id())
            .ok_or(ChangeError::SponsorNotFound)?;
        if !sponsor.is_admin() {
            return Err(ChangeError::SponsorNotAdmin);
        }
        Ok(sponsor)
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Produce the successor snapshot. Pure: the input is never mutated, and
    /// a failure leaves no partial state anywhere.
    ///
    /// Callers run `verify` first; `apply` repeats only the lookups it needs
    /// to build the result.
    pub fn apply(&self, state: &GroupInfo) -> Result<GroupInfo, ChangeError> {
        match self {
            GroupChange::Create {
                group_id,
                group_identifier,
                group_info,
                founder,
                signature,
            } => {
                let mut member = founder.clone();
                member.issue_epoch = 0;
                member.sponsor = signature.key_id;
                Ok(GroupInfo {
                    group_id: *group_id,
                    group_identifier: group_identifier.clone(),
                    epoch: 0,
                    members: vec![member],
                    group_info: group_info.clone(),
                    prev_group_state_hash: [0u8; 32],
                })
            }

            GroupChange::MemberAdd {
                new_info,
                signature,
            } => {
                let mut next = state.successor();
                let mut member = new_info.clone();
                member.issue_epoch = next.epoch;
                member.sponsor = signature.key_id;
                next.members.push(member);
                Ok(next)
            }

            GroupChange::MemberRemove {
                member_key_id,
                new_sponsor_dh_key,
                signature,
            } => {
                state
                    .member_by_key_id(member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                let mut next = state.successor();
                next.members.retain(|m| m.member_key_id() != *member_key_id);
                for member in &mut next.members {
                    // Orphaned sponsees are re-parented onto the remover.
                    if member.sponsor == *member_key_id {
                        member.sponsor = signature.key_id;
                    }
                    if member.member_key_id() == signature.key_id {
                        member.group_dh_key = *new_sponsor_dh_key;
                    }
                }
                Ok(next)
            }

            GroupChange::Modify { new_group_info, .. } => {
                let mut next = state.successor();
                next.group_info = new_group_info.clone();
                Ok(next)
            }

            GroupChange::AdminChange {
                member_key_id,
                new_role,
                new_other_info,
                signature,
            } => {
                let mut next = state.successor();
                let epoch = next.epoch;
                let member = next
                    .members
                    .iter_mut()
                    .find(|m| m.member_key_id() == *member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                let role_changed = member.role != *new_role;
                member.role = *new_role;
                member.other_info = new_other_info.clone();
                if role_changed {
                    member.sponsor = signature.key_id;
                    member.issue_epoch = epoch;
                }
                Ok(next)
            }

            GroupChange::KeyRotate {
                member_key_id,
                new_key,
                new_dh_key,
                rotated_at,
                ..
            } => {
                let mut next = state.successor();
                let member = next
                    .members
                    .iter_mut()
                    .find(|m| m.member_key_id() == *member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                if let Some(key) = new_key {
                    member.historic_keys.push(HistoricKey {
                        key: member.member_key,
                        valid_from: member.key_issued,
                        valid_until: *rotated_at,
                    });
                    member.member_key = *key;
                    member.key_issued = *rotated_at;
                }
                if let Some(dh) = new_dh_key {
                    member.group_dh_key = *dh;
                }
                Ok(next)
            }

            GroupChange::AddressChange {
                member_key_id,
                new_address,
                ..
            } => {
                let mut next = state.successor();
                let member = next
                    .members
                    .iter_mut()
                    .find(|m| m.member_key_id() == *member_key_id)
                    .ok_or(ChangeError::MemberNotFound(*member_key_id))?;
                member.routing_address = *new_address;
                Ok(next)
            }

            GroupChange::Merge { .. } => Err(ChangeError::MergeNotApplicable),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::keys::MemoryKeyService;

    fn new_member(keys: &mut MemoryKeyService, name: &str, role: Role) -> GroupMemberInfo {
        let key_id = keys.generate_signing_key().unwrap();
        let dh_id = keys.generate_dh_key().unwrap();
        GroupMemberInfo {
            member_name: name.to_string(),
            member_key: keys.signing_key(&key_id).unwrap(),
            key_issued: 1_000,
            issue_epoch: 0,
            sponsor: key_id,
            role,
            other_info: BTreeMap::new(),
            historic_keys: vec![],
            group_dh_key: keys.dh_key(&dh_id).unwrap(),
            routing_address: *blake3::hash(name.as_bytes()).as_bytes(),
        }
    }

    fn make_create(keys: &MemoryKeyService, founder: &GroupMemberInfo) -> GroupChange {
        let mut change = GroupChange::Create {
            group_id: GroupId::new(&founder.member_key_id(), &[9u8; 32]),
            group_identifier: "ops".to_string(),
            group_info: BTreeMap::new(),
            founder: founder.clone(),
            signature: SignatureWithKey::placeholder(founder.member_key_id()),
        };
        change.sign(keys).unwrap();
        change
    }

    fn make_add(
        keys: &MemoryKeyService,
        sponsor: &GroupMemberInfo,
        new_info: GroupMemberInfo,
    ) -> GroupChange {
        let mut change = GroupChange::MemberAdd {
            new_info,
            signature: SignatureWithKey::placeholder(sponsor.member_key_id()),
        };
        change.sign(keys).unwrap();
        change
    }

    fn apply_checked(state: &GroupInfo, change: &GroupChange) -> GroupInfo {
        change.verify(state).unwrap();
        change.apply(state).unwrap()
    }

    /// Founder Alice (admin) at epoch 0.
    fn created_group(keys: &mut MemoryKeyService) -> (GroupInfo, GroupMemberInfo) {
        let founder = new_member(keys, "alice", Role::Admin);
        let change = make_create(keys, &founder);
        let state = apply_checked(&GroupInfo::empty(), &change);
        (state, founder)
    }

    #[test]
    fn test_create_applies_on_empty_group() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);

        assert_eq!(state.epoch, 0);
        assert_eq!(state.members.len(), 1);
        let member = &state.members[0];
        assert_eq!(member.member_name, "alice");
        assert_eq!(member.issue_epoch, 0);
        assert_eq!(member.sponsor, founder.member_key_id());
    }

    #[test]
    fn test_create_rejected_on_existing_group() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);
        let again = make_create(&keys, &founder);
        assert!(matches!(
            again.verify(&state),
            Err(ChangeError::GroupAlreadyCreated)
        ));
    }

    #[test]
    fn test_create_rejects_ordinary_founder() {
        let mut keys = MemoryKeyService::new();
        let founder = new_member(&mut keys, "alice", Role::Ordinary);
        let change = make_create(&keys, &founder);
        assert!(matches!(
            change.verify(&GroupInfo::empty()),
            Err(ChangeError::FounderNotAdmin)
        ));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let mut change = make_add(&keys, &founder, bob);

        if let GroupChange::MemberAdd { signature, .. } = &mut change {
            signature.signature[10] ^= 0x01;
        }
        assert!(matches!(
            change.verify(&state),
            Err(ChangeError::InvalidSignature)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let mut change = make_add(&keys, &founder, bob);

        // Mutating a signed field invalidates the signature.
        if let GroupChange::MemberAdd { new_info, .. } = &mut change {
            new_info.role = Role::Admin;
        }
        assert!(matches!(
            change.verify(&state),
            Err(ChangeError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wire_roundtrip_stays_verifiable() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let change = make_add(&keys, &founder, bob);

        let decoded = GroupChange::from_bytes(&change.to_bytes().unwrap()).unwrap();
        assert_eq!(change, decoded);
        decoded.verify(&state).unwrap();
    }

    #[test]
    fn test_member_add_stamps_epoch_and_sponsor() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let next = apply_checked(&state, &make_add(&keys, &founder, bob.clone()));

        assert_eq!(next.epoch, 1);
        let added = next.member_by_name("bob").unwrap();
        // Stamped by apply, regardless of what the proposed record carried.
        assert_eq!(added.issue_epoch, 1);
        assert_eq!(added.sponsor, founder.member_key_id());
        assert_eq!(next.prev_group_state_hash, state.group_state_hash());
    }

    #[test]
    fn test_member_add_rejects_duplicates() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);

        let mut same_name = new_member(&mut keys, "alice", Role::Ordinary);
        assert!(matches!(
            make_add(&keys, &founder, same_name.clone()).verify(&state),
            Err(ChangeError::DuplicateName(_))
        ));

        same_name.member_name = "bob".to_string();
        same_name.member_key = founder.member_key;
        assert!(matches!(
            make_add(&keys, &founder, same_name.clone()).verify(&state),
            Err(ChangeError::DuplicateSigningKey)
        ));

        let mut same_dh = new_member(&mut keys, "carol", Role::Ordinary);
        same_dh.group_dh_key = founder.group_dh_key;
        assert!(matches!(
            make_add(&keys, &founder, same_dh).verify(&state),
            Err(ChangeError::DuplicateDhKey)
        ));

        let mut same_addr = new_member(&mut keys, "dave", Role::Ordinary);
        same_addr.routing_address = founder.routing_address;
        assert!(matches!(
            make_add(&keys, &founder, same_addr).verify(&state),
            Err(ChangeError::DuplicateAddress)
        ));
    }

    #[test]
    fn test_member_add_requires_admin_sponsor() {
        let mut keys = MemoryKeyService::new();
        let (state, founder) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let state = apply_checked(&state, &make_add(&keys, &founder, bob.clone()));

        let carol = new_member(&mut keys, "carol", Role::Ordinary);
        assert!(matches!(
            make_add(&keys, &bob, carol.clone()).verify(&state),
            Err(ChangeError::SponsorNotAdmin)
        ));

        let stranger = new_member(&mut keys, "mallory", Role::Admin);
        assert!(matches!(
            make_add(&keys, &stranger, carol).verify(&state),
            Err(ChangeError::SponsorNotFound)
        ));
    }

    #[test]
    fn test_member_remove_reparents_and_rotates_dh() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Admin);
        let state = apply_checked(&state, &make_add(&keys, &alice, bob.clone()));
        // Carol is sponsored by Bob.
        let carol = new_member(&mut keys, "carol", Role::Ordinary);
        let state = apply_checked(&state, &make_add(&keys, &bob, carol));

        let (new_dh, _) = crate::crypto::signing::generate_dh_keypair();
        let mut remove = GroupChange::MemberRemove {
            member_key_id: bob.member_key_id(),
            new_sponsor_dh_key: new_dh,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        remove.sign(&keys).unwrap();
        let next = apply_checked(&state, &remove);

        assert_eq!(next.members.len(), 2);
        assert!(next.member_by_name("bob").is_none());
        // Carol re-parented onto the remover.
        assert_eq!(
            next.member_by_name("carol").unwrap().sponsor,
            alice.member_key_id()
        );
        // The remover's DH key rotated in the same change.
        assert_eq!(next.member_by_name("alice").unwrap().group_dh_key, new_dh);
    }

    #[test]
    fn test_remove_last_admin_rejected() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let (new_dh, _) = crate::crypto::signing::generate_dh_keypair();
        let mut remove = GroupChange::MemberRemove {
            member_key_id: alice.member_key_id(),
            new_sponsor_dh_key: new_dh,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        remove.sign(&keys).unwrap();
        assert!(matches!(remove.verify(&state), Err(ChangeError::LastAdmin)));
    }

    #[test]
    fn test_modify_replaces_group_metadata() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let mut metadata = BTreeMap::new();
        metadata.insert("topic".to_string(), "standup".to_string());
        let mut modify = GroupChange::Modify {
            new_group_info: metadata.clone(),
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        modify.sign(&keys).unwrap();
        let next = apply_checked(&state, &modify);
        assert_eq!(next.group_info, metadata);
        assert_eq!(next.epoch, state.epoch + 1);
    }

    #[test]
    fn test_junior_admin_cannot_demote_senior() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Admin);
        let state = apply_checked(&state, &make_add(&keys, &alice, bob.clone()));

        // Bob (issue_epoch 1) targeting Alice (issue_epoch 0).
        let mut demote = GroupChange::AdminChange {
            member_key_id: alice.member_key_id(),
            new_role: Role::Ordinary,
            new_other_info: BTreeMap::new(),
            signature: SignatureWithKey::placeholder(bob.member_key_id()),
        };
        demote.sign(&keys).unwrap();
        assert!(matches!(
            demote.verify(&state),
            Err(ChangeError::SeniorityViolation)
        ));
    }

    #[test]
    fn test_senior_admin_demotes_junior() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Admin);
        let state = apply_checked(&state, &make_add(&keys, &alice, bob.clone()));

        let mut demote = GroupChange::AdminChange {
            member_key_id: bob.member_key_id(),
            new_role: Role::Ordinary,
            new_other_info: BTreeMap::new(),
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        demote.sign(&keys).unwrap();
        let next = apply_checked(&state, &demote);

        let demoted = next.member_by_name("bob").unwrap();
        assert_eq!(demoted.role, Role::Ordinary);
        // Role changed: authorization restamped.
        assert_eq!(demoted.issue_epoch, next.epoch);
        assert_eq!(demoted.sponsor, alice.member_key_id());
    }

    #[test]
    fn test_self_demotion_bypasses_seniority() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Admin);
        let state = apply_checked(&state, &make_add(&keys, &alice, bob.clone()));

        let mut demote = GroupChange::AdminChange {
            member_key_id: bob.member_key_id(),
            new_role: Role::Ordinary,
            new_other_info: BTreeMap::new(),
            signature: SignatureWithKey::placeholder(bob.member_key_id()),
        };
        demote.sign(&keys).unwrap();
        apply_checked(&state, &demote);
    }

    #[test]
    fn test_demoting_last_admin_rejected() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);

        // Self-targeted, so seniority allows it; the admin floor does not.
        let mut demote = GroupChange::AdminChange {
            member_key_id: alice.member_key_id(),
            new_role: Role::Ordinary,
            new_other_info: BTreeMap::new(),
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        demote.sign(&keys).unwrap();
        assert!(matches!(demote.verify(&state), Err(ChangeError::LastAdmin)));
    }

    #[test]
    fn test_unchanged_role_keeps_seniority() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let state = apply_checked(&state, &make_add(&keys, &alice, bob.clone()));

        let mut info = BTreeMap::new();
        info.insert("contact".to_string(), "bob@example".to_string());
        let mut change = GroupChange::AdminChange {
            member_key_id: bob.member_key_id(),
            new_role: Role::Ordinary,
            new_other_info: info.clone(),
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        change.sign(&keys).unwrap();
        let next = apply_checked(&state, &change);

        let updated = next.member_by_name("bob").unwrap();
        assert_eq!(updated.other_info, info);
        // Info-only update: authorization stamp untouched.
        assert_eq!(updated.issue_epoch, 1);
    }

    #[test]
    fn test_key_rotate_signing_key() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let old_key = alice.member_key;
        let old_id = alice.member_key_id();
        let new_id = keys.generate_signing_key().unwrap();
        let new_key = keys.signing_key(&new_id).unwrap();

        let mut rotate = GroupChange::KeyRotate {
            member_key_id: old_id,
            new_key: Some(new_key),
            new_dh_key: None,
            rotated_at: 2_000,
            signature: SignatureWithKey::placeholder(old_id),
            new_key_signature: Some(SignatureWithKey::placeholder(new_id)),
        };
        rotate.sign(&keys).unwrap();
        let next = apply_checked(&state, &rotate);

        assert!(next.member_by_key_id(&old_id).is_none());
        let rotated = next.member_by_key_id(&new_id).unwrap();
        assert_eq!(rotated.member_key, new_key);
        assert_eq!(rotated.key_issued, 2_000);
        assert_eq!(
            rotated.historic_keys,
            vec![HistoricKey {
                key: old_key,
                valid_from: 1_000,
                valid_until: 2_000,
            }]
        );
        // The retired key stays burned.
        assert!(next.signing_key_in_use(&old_key));
    }

    #[test]
    fn test_key_rotate_requires_possession_proof() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let new_id = keys.generate_signing_key().unwrap();
        let new_key = keys.signing_key(&new_id).unwrap();

        let mut rotate = GroupChange::KeyRotate {
            member_key_id: alice.member_key_id(),
            new_key: Some(new_key),
            new_dh_key: None,
            rotated_at: 2_000,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
            new_key_signature: None,
        };
        rotate.sign(&keys).unwrap();
        assert!(matches!(
            rotate.verify(&state),
            Err(ChangeError::MissingNewKeySignature)
        ));
    }

    #[test]
    fn test_key_rotate_rejects_non_advancing_time() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let new_id = keys.generate_signing_key().unwrap();
        let new_key = keys.signing_key(&new_id).unwrap();

        let mut rotate = GroupChange::KeyRotate {
            member_key_id: alice.member_key_id(),
            new_key: Some(new_key),
            new_dh_key: None,
            rotated_at: 1_000, // == key_issued
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
            new_key_signature: Some(SignatureWithKey::placeholder(new_id)),
        };
        rotate.sign(&keys).unwrap();
        assert!(matches!(
            rotate.verify(&state),
            Err(ChangeError::RotationNotAfterIssue)
        ));
    }

    #[test]
    fn test_key_rotate_rejects_key_already_in_use() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let state = apply_checked(&state, &make_add(&keys, &alice, bob.clone()));

        let mut rotate = GroupChange::KeyRotate {
            member_key_id: alice.member_key_id(),
            new_key: Some(bob.member_key),
            new_dh_key: None,
            rotated_at: 2_000,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
            new_key_signature: Some(SignatureWithKey::placeholder(bob.member_key_id())),
        };
        rotate.sign(&keys).unwrap();
        assert!(matches!(
            rotate.verify(&state),
            Err(ChangeError::DuplicateSigningKey)
        ));
    }

    #[test]
    fn test_key_rotate_dh_only() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let dh_id = keys.generate_dh_key().unwrap();
        let new_dh = keys.dh_key(&dh_id).unwrap();

        let mut rotate = GroupChange::KeyRotate {
            member_key_id: alice.member_key_id(),
            new_key: None,
            new_dh_key: Some(new_dh),
            rotated_at: 2_000,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
            new_key_signature: None,
        };
        rotate.sign(&keys).unwrap();
        let next = apply_checked(&state, &rotate);

        let member = next.member_by_name("alice").unwrap();
        assert_eq!(member.group_dh_key, new_dh);
        // DH rotation leaves the signing key and its issue time alone.
        assert_eq!(member.member_key, alice.member_key);
        assert_eq!(member.key_issued, 1_000);
        assert!(member.historic_keys.is_empty());
    }

    #[test]
    fn test_key_rotate_rejects_empty_and_double_rotation() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);

        let mut neither = GroupChange::KeyRotate {
            member_key_id: alice.member_key_id(),
            new_key: None,
            new_dh_key: None,
            rotated_at: 2_000,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
            new_key_signature: None,
        };
        neither.sign(&keys).unwrap();
        assert!(matches!(
            neither.verify(&state),
            Err(ChangeError::InvalidRotation)
        ));
    }

    #[test]
    fn test_address_change() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let new_address = [0xEE; 32];

        let mut change = GroupChange::AddressChange {
            member_key_id: alice.member_key_id(),
            old_address: alice.routing_address,
            new_address,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        change.sign(&keys).unwrap();
        let next = apply_checked(&state, &change);
        assert_eq!(
            next.member_by_name("alice").unwrap().routing_address,
            new_address
        );

        // Replaying against the new state fails the old-address guard.
        assert!(matches!(
            change.verify(&next),
            Err(ChangeError::StaleAddress)
        ));
    }

    #[test]
    fn test_address_change_requires_self_signature() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);
        let bob = new_member(&mut keys, "bob", Role::Ordinary);
        let state = apply_checked(&state, &make_add(&keys, &alice, bob.clone()));

        let mut change = GroupChange::AddressChange {
            member_key_id: bob.member_key_id(),
            old_address: bob.routing_address,
            new_address: [0xEE; 32],
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        change.sign(&keys).unwrap();
        assert!(matches!(
            change.verify(&state),
            Err(ChangeError::SignerMismatch)
        ));
    }

    #[test]
    fn test_merge_verify_rules() {
        let mut keys = MemoryKeyService::new();
        let (state, alice) = created_group(&mut keys);

        let mut one_hash = BTreeSet::new();
        one_hash.insert([1u8; 32]);
        let mut short = GroupChange::Merge {
            previous_group_info_hashes: one_hash,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        short.sign(&keys).unwrap();
        assert!(matches!(
            short.verify(&state),
            Err(ChangeError::TooFewMergeHashes)
        ));

        let mut two_hashes = BTreeSet::new();
        two_hashes.insert([1u8; 32]);
        two_hashes.insert([2u8; 32]);
        let mut merge = GroupChange::Merge {
            previous_group_info_hashes: two_hashes,
            signature: SignatureWithKey::placeholder(alice.member_key_id()),
        };
        merge.sign(&keys).unwrap();
        merge.verify(&state).unwrap();

        // Merges are folded by replay, never applied as a state transition.
        assert!(matches!(
            merge.apply(&state),
            Err(ChangeError::MergeNotApplicable)
        ));
    }
}
