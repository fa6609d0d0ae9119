// Simulated chain - Block database of one simulated node
//
// Longest chain fork choice, DPoS irreversibility at a fixed confirmation
// depth below head, and orphan buffering for blocks that arrive before their
// parent.

use crate::consensus::randpa::AcceptedBlock;
use crate::types::keys::PublicKey;
use crate::types::primitives::{BlockId, BlockNumber, Digest};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Genesis block shared by every simulated node
pub fn genesis_id() -> BlockId {
    BlockId::new(0, &Digest::ZERO)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimBlock {
    pub id: BlockId,
    pub prev_id: BlockId,
    pub producer: PublicKey,
    pub active_producers: BTreeSet<PublicKey>,
}

impl SimBlock {
    /// Block produced in `slot` on top of `prev_id`
    pub fn new(
        prev_id: BlockId,
        producer: PublicKey,
        active_producers: BTreeSet<PublicKey>,
        slot: u64,
    ) -> Self {
        let mut preimage = Vec::with_capacity(72);
        preimage.extend_from_slice(prev_id.as_bytes());
        preimage.extend_from_slice(producer.as_bytes());
        preimage.extend_from_slice(&slot.to_le_bytes());

        Self {
            id: BlockId::new(prev_id.height() + 1, &Digest::hash(&preimage)),
            prev_id,
            producer,
            active_producers,
        }
    }

    pub fn height(&self) -> BlockNumber {
        self.id.height()
    }

    /// Simulated blocks are always live
    pub fn accepted(&self) -> AcceptedBlock {
        AcceptedBlock {
            block_id: self.id,
            prev_block_id: self.prev_id,
            creator_key: self.producer,
            active_bp_keys: self.active_producers.clone(),
            is_sync: false,
        }
    }
}

/// Outcome of applying a block
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    /// Newly connected blocks in parent first order
    pub accepted: Vec<SimBlock>,
    /// New lib, if it advanced
    pub irreversible: Option<BlockId>,
}

pub struct SimChain {
    blocks: HashMap<BlockId, SimBlock>,
    /// Blocks waiting for their parent, keyed by the missing parent
    orphans: HashMap<BlockId, Vec<SimBlock>>,
    head: BlockId,
    lib: BlockId,
    conf_number: u32,
}

impl SimChain {
    pub fn new(conf_number: u32) -> Self {
        Self {
            blocks: HashMap::new(),
            orphans: HashMap::new(),
            head: genesis_id(),
            lib: genesis_id(),
            conf_number,
        }
    }

    pub fn head(&self) -> BlockId {
        self.head
    }

    pub fn lib(&self) -> BlockId {
        self.lib
    }

    pub fn conf_number(&self) -> u32 {
        self.conf_number
    }

    pub fn set_conf_number(&mut self, conf_number: u32) {
        self.conf_number = conf_number;
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        *id == genesis_id() || self.blocks.contains_key(id)
    }

    pub fn block(&self, id: &BlockId) -> Option<&SimBlock> {
        self.blocks.get(id)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(Vec::len).sum()
    }

    /// Apply a block received from the network or produced locally
    pub fn apply(&mut self, block: SimBlock) -> ChainUpdate {
        let mut update = ChainUpdate::default();
        if self.contains(&block.id) {
            return update;
        }

        if !self.contains(&block.prev_id) {
            let waiting = self.orphans.entry(block.prev_id).or_default();
            if !waiting.iter().any(|b| b.id == block.id) {
                debug!("orphan block {}, waiting for {}", block.id, block.prev_id);
                waiting.push(block);
            }
            return update;
        }

        let mut pending = vec![block];
        while let Some(block) = pending.pop() {
            if block.height() <= self.lib.height() {
                debug!("block {} is below lib {}, dropped", block.id, self.lib);
                continue;
            }
            let id = block.id;
            self.blocks.insert(id, block.clone());
            update.accepted.push(block);

            if let Some(children) = self.orphans.remove(&id) {
                pending.extend(children);
            }
        }

        for block in &update.accepted {
            if block.height() > self.head.height() && self.descends_from(&block.id, &self.lib) {
                self.head = block.id;
            }
        }

        update.irreversible = self.advance_dpos_lib();
        update
    }

    /// Mark `id` final ahead of the DPoS schedule
    pub fn bft_finalize(&mut self, id: &BlockId) -> Option<BlockId> {
        if !self.contains(id) || id.height() <= self.lib.height() {
            return None;
        }
        if !self.descends_from(id, &self.lib) {
            debug!("finalized block {} is not on top of lib {}", id, self.lib);
            return None;
        }

        self.lib = *id;
        if !self.descends_from(&self.head, id) {
            self.head = *id;
        }
        Some(self.lib)
    }

    /// Ancestor of `id` at `height`, `id` itself included
    pub fn ancestor_at(&self, id: &BlockId, height: BlockNumber) -> Option<BlockId> {
        let mut current = *id;
        while current.height() > height {
            current = self.blocks.get(&current)?.prev_id;
        }
        (current.height() == height).then_some(current)
    }

    fn descends_from(&self, id: &BlockId, ancestor: &BlockId) -> bool {
        self.ancestor_at(id, ancestor.height()) == Some(*ancestor)
    }

    fn advance_dpos_lib(&mut self) -> Option<BlockId> {
        let target = self.head.height().checked_sub(self.conf_number)?;
        if target <= self.lib.height() {
            return None;
        }
        self.lib = self.ancestor_at(&self.head, target)?;
        Some(self.lib)
    }
}
