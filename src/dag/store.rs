/// Block storage with head tracking and causal rounds.
///
/// A block's round is its causal depth: roots are round 0, every other block
/// is one past the deepest of its predecessors. Heads are the blocks nothing
/// extends yet; they are the attachment points for new local blocks and the
/// inputs to a merge.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

use crate::dag::block::{Block, BlockId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unknown block: {0}")]
    UnknownBlock(BlockId),

    #[error("Block {block} references missing predecessor {pred}")]
    MissingPredecessor { block: BlockId, pred: BlockId },

    #[error("Non-root block must have at least one predecessor")]
    NoPredecessors,
}

// ---------------------------------------------------------------------------
// BlockStore
// ---------------------------------------------------------------------------

pub trait BlockStore {
    /// Blocks nothing extends yet, in id order.
    fn heads(&self) -> Vec<BlockId>;

    /// Look up a block by id.
    fn block(&self, id: &BlockId) -> Option<&Block>;

    /// Causal depth of a stored block.
    fn round(&self, id: &BlockId) -> Option<u64>;

    fn contains(&self, id: &BlockId) -> bool;

    /// Transitive predecessor closure of `ids`, including the ids themselves
    /// and excluding root markers.
    fn predecessor_set(&self, ids: &[BlockId]) -> Result<BTreeSet<BlockId>, StoreError>;

    /// Store a block. Idempotent: re-inserting a stored block is a no-op.
    /// All predecessors must already be present.
    fn insert(&mut self, block: Block) -> Result<BlockId, StoreError>;

    /// Every stored block, roots first, then ascending (round, id). A
    /// receiver inserting in this order never sees a missing predecessor.
    fn blocks_in_causal_order(&self) -> Vec<Block>;
}

// ---------------------------------------------------------------------------
// MemoryBlockStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: BTreeMap<BlockId, Block>,
    rounds: BTreeMap<BlockId, u64>,
    heads: BTreeSet<BlockId>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn heads(&self) -> Vec<BlockId> {
        self.heads.iter().copied().collect()
    }

    fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    fn round(&self, id: &BlockId) -> Option<u64> {
        self.rounds.get(id).copied()
    }

    fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    fn predecessor_set(&self, ids: &[BlockId]) -> Result<BTreeSet<BlockId>, StoreError> {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<BlockId> = ids.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            let block = self
                .blocks
                .get(&id)
                .ok_or(StoreError::UnknownBlock(id))?;
            if block.is_root || !closure.insert(id) {
                continue;
            }
            queue.extend(block.predecessors.iter().copied());
        }
        Ok(closure)
    }

    fn insert(&mut self, block: Block) -> Result<BlockId, StoreError> {
        let id = block.id();
        if self.blocks.contains_key(&id) {
            return Ok(id);
        }
        if !block.is_root && block.predecessors.is_empty() {
            return Err(StoreError::NoPredecessors);
        }

        let mut round = 0u64;
        for pred in &block.predecessors {
            let pred_round = self
                .rounds
                .get(pred)
                .ok_or(StoreError::MissingPredecessor { block: id, pred: *pred })?;
            round = round.max(pred_round + 1);
        }

        for pred in &block.predecessors {
            self.heads.remove(pred);
        }
        self.heads.insert(id);
        self.rounds.insert(id, round);
        self.blocks.insert(id, block);
        Ok(id)
    }

    fn blocks_in_causal_order(&self) -> Vec<Block> {
        let mut ordered: Vec<(u64, BlockId)> = self
            .rounds
            .iter()
            .map(|(id, round)| (*round, *id))
            .collect();
        ordered.sort();
        ordered
            .into_iter()
            .filter_map(|(_, id)| self.blocks.get(&id).cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
