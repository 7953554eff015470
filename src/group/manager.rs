/// Replicated group reconciliation engine.
///
/// A `GroupManager` owns one replica's view of a group: a causal block DAG of
/// signed `GroupChange`s, a snapshot per origin replica, and a promoted
/// `current_best` snapshot. Local mutations validate synchronously and append
/// a block extending the current heads; remote blocks are folded in as they
/// arrive, and divergent branches are unified with signed Merge blocks whose
/// outcome is deterministic on every replica.
///
/// Delivery is defensive: a remote block that fails validation is logged and
/// discarded, never an error surfaced to the caller.

use chrono::Utc;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::dag::block::{Block, BlockId};
use crate::dag::store::{BlockStore, StoreError};
use crate::dag::sync::{BlockSyncMessage, MemberService};
use crate::group::change::{ChangeError, GroupChange, SignatureWithKey};
use crate::group::ids::{GroupId, KeyId, StateHash};
use crate::group::info::GroupInfo;
use crate::group::keys::{GroupKeyService, KeyServiceError};
use crate::group::member::{GroupMemberInfo, Role};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Local member does not hold the Admin role")]
    NotAdmin,

    #[error("Local key is not a member of the group")]
    NotAMember,

    #[error("Group has not been created yet")]
    GroupNotCreated,

    #[error("Group already created")]
    GroupAlreadyCreated,

    #[error("Member not found: {0}")]
    MemberNotFound(KeyId),

    #[error("Non-merge block must have exactly one predecessor, found {0}")]
    MalformedBlock(usize),

    #[error("Block payload is not a merge change")]
    NotAMerge,

    #[error("Merge hash set does not match predecessor snapshots")]
    MergeHashMismatch,

    #[error("Replay closure contains {0} Create changes, expected exactly one")]
    CreateCount(usize),

    #[error(transparent)]
    Change(#[from] ChangeError),

    #[error(transparent)]
    Keys(#[from] KeyServiceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// GroupManager
// ---------------------------------------------------------------------------

pub struct GroupManager<S, K, M> {
    store: S,
    keys: K,
    member_service: M,
    /// KeyId of the local member's current signing key; doubles as the origin
    /// id on authored blocks. Updated by `rotate_key`.
    local_key_id: KeyId,
    /// KeyId of the local member's current key-agreement key.
    local_dh_key_id: KeyId,
    /// Latest snapshot per origin replica.
    group_info_by_source: BTreeMap<KeyId, GroupInfo>,
    /// The block that produced each origin's snapshot. A delivered block
    /// whose predecessor is not its origin's tip chains onto stale state, and
    /// falls back to a full replay instead.
    branch_tips: BTreeMap<KeyId, BlockId>,
    /// Snapshot fingerprint after each successfully folded block; merge
    /// provenance is checked against these.
    block_state_hash: BTreeMap<BlockId, StateHash>,
    /// Blocks already folded (or discarded); delivery is one-shot.
    applied: BTreeSet<BlockId>,
    /// Highest-epoch snapshot seen so far.
    current_best: GroupInfo,
    peer_cursor: usize,
}

impl<S, K, M> GroupManager<S, K, M>
where
    S: BlockStore,
    K: GroupKeyService,
    M: MemberService,
{
    pub fn new(
        store: S,
        keys: K,
        member_service: M,
        local_key_id: KeyId,
        local_dh_key_id: KeyId,
    ) -> Self {
        GroupManager {
            store,
            keys,
            member_service,
            local_key_id,
            local_dh_key_id,
            group_info_by_source: BTreeMap::new(),
            branch_tips: BTreeMap::new(),
            block_state_hash: BTreeMap::new(),
            applied: BTreeSet::new(),
            current_best: GroupInfo::empty(),
            peer_cursor: 0,
        }
    }

    /// The best snapshot this replica currently knows.
    pub fn group_info(&self) -> &GroupInfo {
        &self.current_best
    }

    pub fn local_key_id(&self) -> KeyId {
        self.local_key_id
    }

    // -----------------------------------------------------------------------
    // Local mutations
    // -----------------------------------------------------------------------

    /// Found a new group with the local key as sole admin.
    pub fn create_group(
        &mut self,
        group_identifier: &str,
        group_info: BTreeMap<String, String>,
        member_name: &str,
        other_info: BTreeMap<String, String>,
        routing_address: [u8; 32],
    ) -> Result<GroupId, ManagerError> {
        if !self.current_best.is_empty_group() || !self.store.heads().is_empty() {
            return Err(ManagerError::GroupAlreadyCreated);
        }

        let founder = GroupMemberInfo {
            member_name: member_name.to_string(),
            member_key: self.keys.signing_key(&self.local_key_id)?,
            key_issued: now_millis(),
            issue_epoch: 0,
            sponsor: self.local_key_id,
            role: Role::Admin,
            other_info,
            historic_keys: vec![],
            group_dh_key: self.keys.dh_key(&self.local_dh_key_id)?,
            routing_address,
        };
        let group_id = GroupId::new(&self.local_key_id, &rand::random::<[u8; 32]>());

        let root_id = self.store.insert(Block::root(self.local_key_id))?;
        self.applied.insert(root_id);

        let mut change = GroupChange::Create {
            group_id,
            group_identifier: group_identifier.to_string(),
            group_info,
            founder,
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        change.sign(&self.keys)?;
        change.verify(&GroupInfo::empty())?;
        let created = change.apply(&GroupInfo::empty())?;

        let block = Block::new(
            self.local_key_id,
            change.to_bytes()?,
            [root_id].into_iter().collect(),
        );
        let id = self.store.insert(block)?;
        self.applied.insert(id);
        self.record_snapshot(self.local_key_id, id, created);
        Ok(group_id)
    }

    /// Add a member. Requires local Admin.
    pub fn add_member(&mut self, new_info: GroupMemberInfo) -> Result<(), ManagerError> {
        self.require_admin()?;
        let change = GroupChange::MemberAdd {
            new_info,
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        self.submit(change)
    }

    /// Remove a member. Requires local Admin. The local DH key rotates in
    /// the same change, so the removed member cannot follow future key
    /// agreements.
    pub fn delete_member(&mut self, member_key_id: KeyId) -> Result<(), ManagerError> {
        self.require_admin()?;
        let new_dh_id = self.keys.generate_dh_key()?;
        let change = GroupChange::MemberRemove {
            member_key_id,
            new_sponsor_dh_key: self.keys.dh_key(&new_dh_id)?,
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        self.submit(change)?;
        self.local_dh_key_id = new_dh_id;
        Ok(())
    }

    /// Change a member's role, keeping their free-form info. Requires local
    /// Admin.
    pub fn change_member_role(
        &mut self,
        member_key_id: KeyId,
        new_role: Role,
    ) -> Result<(), ManagerError> {
        self.require_admin()?;
        let member = self
            .current_best
            .member_by_key_id(&member_key_id)
            .ok_or(ManagerError::MemberNotFound(member_key_id))?;
        let change = GroupChange::AdminChange {
            member_key_id,
            new_role,
            new_other_info: member.other_info.clone(),
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        self.submit(change)
    }

    /// Replace a member's free-form info, keeping their role. Requires local
    /// Admin.
    pub fn change_member_info(
        &mut self,
        member_key_id: KeyId,
        new_other_info: BTreeMap<String, String>,
    ) -> Result<(), ManagerError> {
        self.require_admin()?;
        let member = self
            .current_best
            .member_by_key_id(&member_key_id)
            .ok_or(ManagerError::MemberNotFound(member_key_id))?;
        let change = GroupChange::AdminChange {
            member_key_id,
            new_role: member.role,
            new_other_info,
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        self.submit(change)
    }

    /// Replace the group-level metadata map. Requires local Admin.
    pub fn change_group_info(
        &mut self,
        new_group_info: BTreeMap<String, String>,
    ) -> Result<(), ManagerError> {
        self.require_admin()?;
        let change = GroupChange::Modify {
            new_group_info,
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        self.submit(change)
    }

    /// Rotate the local signing key. Self-service: any member may do this.
    /// The local identity follows the new key once the change is in.
    pub fn rotate_key(&mut self) -> Result<(), ManagerError> {
        let member = self.local_member()?;
        let rotated_at = now_millis().max(member.key_issued + 1);
        let new_id = self.keys.generate_signing_key()?;
        let change = GroupChange::KeyRotate {
            member_key_id: self.local_key_id,
            new_key: Some(self.keys.signing_key(&new_id)?),
            new_dh_key: None,
            rotated_at,
            signature: SignatureWithKey::placeholder(self.local_key_id),
            new_key_signature: Some(SignatureWithKey::placeholder(new_id)),
        };
        self.submit(change)?;
        self.local_key_id = new_id;
        Ok(())
    }

    /// Rotate the local key-agreement key. Self-service.
    pub fn rotate_dh_key(&mut self) -> Result<(), ManagerError> {
        let member = self.local_member()?;
        let rotated_at = now_millis().max(member.key_issued + 1);
        let new_dh_id = self.keys.generate_dh_key()?;
        let change = GroupChange::KeyRotate {
            member_key_id: self.local_key_id,
            new_key: None,
            new_dh_key: Some(self.keys.dh_key(&new_dh_id)?),
            rotated_at,
            signature: SignatureWithKey::placeholder(self.local_key_id),
            new_key_signature: None,
        };
        self.submit(change)?;
        self.local_dh_key_id = new_dh_id;
        Ok(())
    }

    /// Announce a new routing address for the local member. Self-service.
    pub fn set_new_address(&mut self, new_address: [u8; 32]) -> Result<(), ManagerError> {
        let member = self.local_member()?;
        let change = GroupChange::AddressChange {
            member_key_id: self.local_key_id,
            old_address: member.routing_address,
            new_address,
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        self.submit(change)
    }

    fn local_member(&self) -> Result<&GroupMemberInfo, ManagerError> {
        self.current_best
            .member_by_key_id(&self.local_key_id)
            .ok_or(ManagerError::NotAMember)
    }

    fn require_admin(&self) -> Result<(), ManagerError> {
        if self.local_member()?.is_admin() {
            Ok(())
        } else {
            Err(ManagerError::NotAdmin)
        }
    }

    /// Shared tail of every local mutation: unify heads first, then validate
    /// against the branch being extended, and only then append the block.
    /// Validation failures surface synchronously to the caller.
    fn submit(&mut self, mut change: GroupChange) -> Result<(), ManagerError> {
        self.merge_heads()?;
        let heads = self.store.heads();
        let base = self.base_snapshot(&heads)?;
        change.sign(&self.keys)?;
        change.verify(&base)?;
        let next = change.apply(&base)?;

        let block = Block::new(
            self.local_key_id,
            change.to_bytes()?,
            heads.into_iter().collect(),
        );
        let id = self.store.insert(block)?;
        self.applied.insert(id);
        self.record_snapshot(self.local_key_id, id, next);
        Ok(())
    }

    fn base_snapshot(&self, heads: &[BlockId]) -> Result<GroupInfo, ManagerError> {
        let head = match heads.first() {
            Some(head) => *head,
            None => return Err(ManagerError::GroupNotCreated),
        };
        let block = self
            .store
            .block(&head)
            .ok_or(StoreError::UnknownBlock(head))?;
        if block.is_root {
            return Ok(GroupInfo::empty());
        }
        if self.branch_tips.get(&block.origin) == Some(&head) {
            if let Some(info) = self.group_info_by_source.get(&block.origin) {
                return Ok(info.clone());
            }
        }
        self.replay(heads)
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Unify divergent heads with a signed Merge block. No-op when the DAG
    /// has at most one head.
    pub fn merge_heads(&mut self) -> Result<Option<BlockId>, ManagerError> {
        let heads = self.store.heads();
        if heads.len() < 2 {
            return Ok(None);
        }

        let mut hashes = BTreeSet::new();
        for head in &heads {
            hashes.insert(self.snapshot_hash_for(head)?);
        }
        let mut change = GroupChange::Merge {
            previous_group_info_hashes: hashes,
            signature: SignatureWithKey::placeholder(self.local_key_id),
        };
        change.sign(&self.keys)?;

        let block = Block::new(
            self.local_key_id,
            change.to_bytes()?,
            heads.into_iter().collect(),
        );
        let merged = self.fold_merge(&block, &change)?;
        let id = self.store.insert(block)?;
        self.applied.insert(id);
        self.record_snapshot(self.local_key_id, id, merged);
        debug!("merged heads into block {}", id);
        Ok(Some(id))
    }

    /// Deterministically fold a merge block: check the declared provenance
    /// hashes, replay the causal closure of its predecessors phase by phase,
    /// and verify the merge author against the result.
    fn fold_merge(&self, block: &Block, change: &GroupChange) -> Result<GroupInfo, ManagerError> {
        let declared = match change {
            GroupChange::Merge {
                previous_group_info_hashes,
                ..
            } => previous_group_info_hashes,
            _ => return Err(ManagerError::NotAMerge),
        };

        let mut expected = BTreeSet::new();
        for pred in &block.predecessors {
            expected.insert(self.snapshot_hash_for(pred)?);
        }
        if expected != *declared {
            return Err(ManagerError::MergeHashMismatch);
        }

        let preds: Vec<BlockId> = block.predecessors.iter().copied().collect();
        let active = self.replay(&preds)?;
        change.verify(&active)?;
        Ok(active)
    }

    /// Snapshot fingerprint after `id` was folded. Roots and blocks that
    /// were discarded during delivery count as the empty group; discard
    /// decisions are deterministic, so replicas agree on this.
    fn snapshot_hash_for(&self, id: &BlockId) -> Result<StateHash, ManagerError> {
        let block = self.store.block(id).ok_or(StoreError::UnknownBlock(*id))?;
        if block.is_root {
            return Ok(GroupInfo::empty().group_state_hash());
        }
        Ok(self
            .block_state_hash
            .get(id)
            .copied()
            .unwrap_or_else(|| GroupInfo::empty().group_state_hash()))
    }

    /// Replay the causal closure of `start` from the empty group upward.
    ///
    /// Changes are grouped by causal round. A round with concurrent changes
    /// is resolved by sponsor seniority: the changes whose sponsors hold the
    /// minimal issue epoch apply first (in block-id order), then seniority is
    /// recomputed against the evolved state for the rest. A senior admin's
    /// change can thereby strip the authority a concurrent junior change
    /// depended on. Changes failing verification are skipped with a warning;
    /// nested merges carry no mutation and are ignored.
    fn replay(&self, start: &[BlockId]) -> Result<GroupInfo, ManagerError> {
        let closure = self.store.predecessor_set(start)?;

        let mut phases: BTreeMap<u64, BTreeMap<BlockId, GroupChange>> = BTreeMap::new();
        let mut creates = 0usize;
        for id in &closure {
            let block = self.store.block(id).ok_or(StoreError::UnknownBlock(*id))?;
            let round = self.store.round(id).ok_or(StoreError::UnknownBlock(*id))?;
            let change = GroupChange::from_bytes(&block.payload)?;
            if change.is_create() {
                creates += 1;
            }
            phases.entry(round).or_default().insert(*id, change);
        }
        if creates != 1 {
            return Err(ManagerError::CreateCount(creates));
        }

        let mut active = GroupInfo::empty();
        for (_, entries) in phases {
            let mut pending: Vec<(BlockId, GroupChange)> = entries
                .into_iter()
                .filter(|(_, change)| !change.is_merge())
                .collect();
            while !pending.is_empty() {
                let mut min_epoch = i64::MAX;
                for (_, change) in &pending {
                    min_epoch = min_epoch.min(sponsor_seniority(&active, change));
                }
                let (selected, rest): (Vec<_>, Vec<_>) = pending
                    .into_iter()
                    .partition(|(_, change)| sponsor_seniority(&active, change) == min_epoch);
                for (id, change) in selected {
                    match change.verify(&active).and_then(|_| change.apply(&active)) {
                        Ok(next) => active = next,
                        Err(err) => {
                            warn!(
                                "replay: skipping {} change from block {}: {}",
                                change.kind(),
                                id,
                                err
                            );
                        }
                    }
                }
                pending = rest;
            }
        }
        Ok(active)
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Fold one stored block into the membership view. Failures are logged
    /// and the block is discarded; remote input never errors out.
    pub fn deliver_block(&mut self, id: &BlockId) {
        if let Err(err) = self.try_deliver(id) {
            warn!("discarding block {}: {}", id, err);
        }
    }

    fn try_deliver(&mut self, id: &BlockId) -> Result<(), ManagerError> {
        let block = self
            .store
            .block(id)
            .ok_or(StoreError::UnknownBlock(*id))?
            .clone();
        if !self.applied.insert(*id) {
            return Ok(());
        }
        if block.is_root {
            return Ok(());
        }

        let change = GroupChange::from_bytes(&block.payload)?;
        if change.is_merge() {
            let merged = self.fold_merge(&block, &change)?;
            self.record_snapshot(block.origin, *id, merged);
            return Ok(());
        }

        if block.predecessors.len() != 1 {
            return Err(ManagerError::MalformedBlock(block.predecessors.len()));
        }
        let pred = match block.predecessors.iter().next() {
            Some(pred) => *pred,
            None => return Err(ManagerError::MalformedBlock(0)),
        };
        let (pred_is_root, pred_origin) = {
            let pred_block = self
                .store
                .block(&pred)
                .ok_or(StoreError::UnknownBlock(pred))?;
            (pred_block.is_root, pred_block.origin)
        };

        let base = if pred_is_root {
            GroupInfo::empty()
        } else if self.branch_tips.get(&pred_origin) == Some(&pred) {
            match self.group_info_by_source.get(&pred_origin) {
                Some(info) => info.clone(),
                None => GroupInfo::empty(),
            }
        } else {
            // The predecessor was superseded on its origin's branch; chaining
            // onto the recorded snapshot would skip or double-apply changes.
            // Recompute this block's state from its full causal closure.
            let snapshot = self.replay(&[*id])?;
            self.record_snapshot(block.origin, *id, snapshot);
            return Ok(());
        };

        change.verify(&base)?;
        let next = change.apply(&base)?;
        self.record_snapshot(block.origin, *id, next);
        Ok(())
    }

    fn record_snapshot(&mut self, origin: KeyId, block_id: BlockId, info: GroupInfo) {
        self.block_state_hash
            .insert(block_id, info.group_state_hash());
        self.branch_tips.insert(origin, block_id);
        // >= so a merge resolving a tie still supersedes the losing branch.
        if info.epoch >= self.current_best.epoch {
            debug!("promoting snapshot at epoch {}", info.epoch);
            self.current_best = info.clone();
        }
        self.group_info_by_source.insert(origin, info);
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// The next gossip message and the routing address to send it to. Peers
    /// are visited round-robin; `None` when the group has no other members.
    pub fn group_message_to_send(&mut self) -> Option<([u8; 32], BlockSyncMessage)> {
        let peers: Vec<[u8; 32]> = self
            .current_best
            .members
            .iter()
            .filter(|m| m.member_key_id() != self.local_key_id)
            .map(|m| m.routing_address)
            .collect();
        if peers.is_empty() {
            return None;
        }
        let peer = peers[self.peer_cursor % peers.len()];
        self.peer_cursor = self.peer_cursor.wrapping_add(1);
        Some((
            peer,
            BlockSyncMessage {
                heads: self.store.heads(),
                blocks: self.store.blocks_in_causal_order(),
            },
        ))
    }

    /// Ingest a peer's gossip. Unknown origins and undecodable or invalid
    /// blocks are logged and dropped; this never fails.
    pub fn process_group_message(&mut self, message: &BlockSyncMessage) {
        let mut pending: Vec<Block> = message
            .blocks
            .iter()
            .filter(|block| !self.store.contains(&block.id()))
            .cloned()
            .collect();

        loop {
            let mut progressed = false;
            let mut deferred = Vec::new();
            for block in pending {
                if !self.member_service.is_known(&block.origin) {
                    warn!("discarding block from unknown origin {}", block.origin);
                    continue;
                }
                if !block.predecessors.iter().all(|p| self.store.contains(p)) {
                    deferred.push(block);
                    continue;
                }
                let id = block.id();
                match self.store.insert(block) {
                    Ok(_) => {
                        self.deliver_block(&id);
                        progressed = true;
                    }
                    Err(err) => warn!("failed to store block {}: {}", id, err),
                }
            }
            pending = deferred;
            if pending.is_empty() || !progressed {
                break;
            }
        }
        for block in &pending {
            warn!("discarding block {} with missing predecessors", block.id());
        }
    }
}

/// Seniority of a change's sponsor in `state`: the issue epoch of their
/// current status, lower meaning more senior. A sponsor absent from the
/// state ranks most senior, so the group's founding lineage can never be
/// outranked by a record it is about to invalidate.
fn sponsor_seniority(state: &GroupInfo, change: &GroupChange) -> i64 {
    state
        .member_by_key_id(&change.sponsor_key_id())
        .map(|member| member.issue_epoch)
        .unwrap_or(i64::MIN)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
