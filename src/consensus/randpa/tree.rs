// Fork Tree - Candidate chains since the last irreversible block
//
// The tree is rooted at the lib and indexes every known candidate block twice:
// - an owning parent -> children structure (arena slots addressed by NodeId)
// - a flat block_id -> NodeId index for O(1) lookup
//
// Parent links are plain NodeIds and never own anything. Pruning removes the
// detached subtree from both the arena and the index in the same call, so a
// pruned block is never observable through `find`.

use super::messages::PrevoteMsg;
use crate::types::keys::PublicKey;
use crate::types::primitives::{BlockId, BlockNumber};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Handle of a node in the tree arena; ids are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

/// A linear extension `blocks` hanging off `base_block`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub base_block: BlockId,
    pub blocks: Vec<BlockId>,
}

impl Chain {
    pub fn new(base_block: BlockId, blocks: Vec<BlockId>) -> Self {
        Self { base_block, blocks }
    }
}

/// One candidate block
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Block this node stands for
    pub block_id: BlockId,

    /// Producer of the block (absent for a synthetic root)
    pub creator_key: Option<PublicKey>,

    /// Producers allowed to vote at this block
    pub active_bp_keys: BTreeSet<PublicKey>,

    /// One prevote per voter; a later confirmation from the same key overwrites
    pub confirmation_data: BTreeMap<PublicKey, Arc<PrevoteMsg>>,

    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl TreeNode {
    fn new(
        block_id: BlockId,
        parent: Option<NodeId>,
        creator_key: Option<PublicKey>,
        active_bp_keys: BTreeSet<PublicKey>,
    ) -> Self {
        Self {
            block_id,
            creator_key,
            active_bp_keys,
            confirmation_data: BTreeMap::new(),
            children: Vec::new(),
            parent,
        }
    }

    pub fn height(&self) -> BlockNumber {
        self.block_id.height()
    }

    pub fn confirmation_number(&self) -> usize {
        self.confirmation_data.len()
    }

    pub fn has_confirmation(&self, key: &PublicKey) -> bool {
        self.confirmation_data.contains_key(key)
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

/// Fork tree errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkTreeError {
    #[error("No known ancestor for chain based on {0}")]
    NodeNotFound(BlockId),

    #[error("Parent link broken at {0}")]
    BrokenParentLink(BlockId),

    #[error("Block {child} does not extend {parent} with a greater height")]
    NonIncreasingHeight { parent: BlockId, child: BlockId },
}

/// The prefix tree of candidate chains
#[derive(Debug)]
pub struct ForkTree {
    nodes: HashMap<NodeId, TreeNode>,
    block_index: HashMap<BlockId, NodeId>,
    last_inserted_block: HashMap<PublicKey, NodeId>,
    root: NodeId,
    head: Option<NodeId>,
    next_id: u64,
}

impl ForkTree {
    /// Create a tree whose root is the synthetic node for `root_block`
    pub fn new(root_block: BlockId) -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(root, TreeNode::new(root_block, None, None, BTreeSet::new()));
        let mut block_index = HashMap::new();
        block_index.insert(root_block, root);

        Self {
            nodes,
            block_index,
            last_inserted_block: HashMap::new(),
            root,
            head: None,
            next_id: 1,
        }
    }

    /// O(1) lookup; None if unknown or pruned
    pub fn find(&self, block_id: &BlockId) -> Option<NodeId> {
        self.block_index.get(block_id).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(&id)
    }

    /// Lookup by block id
    pub fn get(&self, block_id: &BlockId) -> Option<&TreeNode> {
        self.find(block_id).and_then(|id| self.nodes.get(&id))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_node(&self) -> &TreeNode {
        &self.nodes[&self.root]
    }

    /// Highest known block, or the root when none is tracked
    pub fn head(&self) -> NodeId {
        self.head
            .filter(|id| self.nodes.contains_key(id))
            .unwrap_or(self.root)
    }

    pub fn head_node(&self) -> &TreeNode {
        &self.nodes[&self.head()]
    }

    pub fn last_inserted_block(&self, key: &PublicKey) -> Option<NodeId> {
        self.last_inserted_block
            .get(key)
            .copied()
            .filter(|id| self.nodes.contains_key(id))
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert the blocks of `chain` that are not yet known
    ///
    /// The anchor is `base_block` if known, else the first known id in `blocks`.
    /// Returns the node of the chain tip.
    pub fn insert(
        &mut self,
        chain: &Chain,
        creator_key: PublicKey,
        active_bp_keys: &BTreeSet<PublicKey>,
    ) -> Result<NodeId, ForkTreeError> {
        let (anchor, offset) = self
            .resolve(chain)
            .ok_or(ForkTreeError::NodeNotFound(chain.base_block))?;
        let blocks = &chain.blocks[offset..];

        let mut parent_id = self.nodes[&anchor].block_id;
        for block_id in blocks {
            if block_id.height() <= parent_id.height() {
                return Err(ForkTreeError::NonIncreasingHeight {
                    parent: parent_id,
                    child: *block_id,
                });
            }
            parent_id = *block_id;
        }

        let mut current = anchor;
        for block_id in blocks {
            current = match self.matching_child(current, block_id) {
                Some(child) => child,
                // Already indexed under another parent: follow the existing node
                None => match self.find(block_id) {
                    Some(existing) => existing,
                    None => self.add_child(current, *block_id, creator_key, active_bp_keys),
                },
            };
        }

        self.last_inserted_block.insert(creator_key, current);

        let tip_height = self.nodes[&current].height();
        if tip_height > self.head_node().height() {
            self.head = Some(current);
        }

        Ok(current)
    }

    /// Record `confirmation` from `voter_key` along the existing part of `chain`
    ///
    /// Returns the visited node with the most confirmations, preferring the
    /// deeper one on ties; None if the chain has no known anchor.
    pub fn add_confirmations(
        &mut self,
        chain: &Chain,
        voter_key: PublicKey,
        confirmation: Arc<PrevoteMsg>,
    ) -> Option<NodeId> {
        let (anchor, offset) = self.resolve(chain)?;

        let mut current = anchor;
        let mut max_node = anchor;
        self.confirm(current, voter_key, &confirmation);

        for block_id in &chain.blocks[offset..] {
            current = match self.matching_child(current, block_id) {
                Some(child) => child,
                None => break,
            };
            let count = self.confirm(current, voter_key, &confirmation);
            if self.nodes[&max_node].confirmation_number() <= count {
                max_node = current;
            }
        }

        Some(max_node)
    }

    /// Drop all vote bookkeeping, keep the shape
    pub fn remove_confirmations(&mut self) {
        for node in self.nodes.values_mut() {
            node.confirmation_data.clear();
        }
    }

    /// Deepest node reachable from root through nodes with at least
    /// `confirmation_threshold` confirmations; None if only the root qualifies
    pub fn get_final_chain_head(&self, confirmation_threshold: usize) -> Option<NodeId> {
        let mut best = (self.root, 0usize);
        let mut stack = vec![(self.root, 0usize)];

        while let Some((id, depth)) = stack.pop() {
            if depth > best.1 {
                best = (id, depth);
            }
            let node = &self.nodes[&id];
            for child in node.children.iter().rev() {
                if self.nodes[child].confirmation_number() >= confirmation_threshold {
                    stack.push((*child, depth + 1));
                }
            }
        }

        if best.0 == self.root {
            None
        } else {
            Some(best.0)
        }
    }

    /// Path from the root (exclusive) to `head_block_id` (inclusive)
    pub fn get_branch(&self, head_block_id: &BlockId) -> Result<Chain, ForkTreeError> {
        let mut current = self
            .find(head_block_id)
            .ok_or(ForkTreeError::NodeNotFound(*head_block_id))?;

        let mut blocks = Vec::new();
        while current != self.root {
            let node = self
                .nodes
                .get(&current)
                .ok_or(ForkTreeError::BrokenParentLink(*head_block_id))?;
            blocks.push(node.block_id);
            current = node
                .parent
                .ok_or(ForkTreeError::BrokenParentLink(node.block_id))?;
        }
        blocks.reverse();

        Ok(Chain::new(self.root_node().block_id, blocks))
    }

    /// Re-root the tree at an existing node, pruning everything outside its subtree
    pub fn set_root(&mut self, new_root: NodeId) -> Result<(), ForkTreeError> {
        if new_root == self.root {
            return Ok(());
        }

        let parent = match self.nodes.get_mut(&new_root) {
            Some(node) => node.parent.take(),
            None => return Err(ForkTreeError::NodeNotFound(self.root_node().block_id)),
        };
        if let Some(parent) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|child| *child != new_root);
        }

        let old_root = self.root;
        self.root = new_root;
        let pruned = self.remove_subtree(old_root);
        self.drop_stale_refs();

        trace!(
            "[RANDPA] tree re-rooted at {}, pruned {} nodes, {} left",
            self.root_node().block_id,
            pruned,
            self.nodes.len()
        );
        Ok(())
    }

    /// Replace the whole tree by a detached root for `block_id`
    pub fn reset_root(&mut self, block_id: BlockId) {
        let old_root = self.root;
        let new_root = self.alloc_id();
        self.remove_subtree(old_root);
        self.nodes
            .insert(new_root, TreeNode::new(block_id, None, None, BTreeSet::new()));
        self.block_index.insert(block_id, new_root);
        self.root = new_root;
        self.drop_stale_refs();
    }

    fn resolve(&self, chain: &Chain) -> Option<(NodeId, usize)> {
        if let Some(node) = self.find(&chain.base_block) {
            return Some((node, 0));
        }

        chain
            .blocks
            .iter()
            .enumerate()
            .find_map(|(i, block_id)| self.find(block_id).map(|node| (node, i + 1)))
    }

    fn matching_child(&self, parent: NodeId, block_id: &BlockId) -> Option<NodeId> {
        self.nodes[&parent]
            .children
            .iter()
            .copied()
            .find(|child| self.nodes[child].block_id == *block_id)
    }

    fn add_child(
        &mut self,
        parent: NodeId,
        block_id: BlockId,
        creator_key: PublicKey,
        active_bp_keys: &BTreeSet<PublicKey>,
    ) -> NodeId {
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            TreeNode::new(block_id, Some(parent), Some(creator_key), active_bp_keys.clone()),
        );
        self.block_index.insert(block_id, id);
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.push(id);
        }
        id
    }

    fn confirm(&mut self, id: NodeId, key: PublicKey, confirmation: &Arc<PrevoteMsg>) -> usize {
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.confirmation_data.insert(key, Arc::clone(confirmation));
                node.confirmation_data.len()
            }
            None => 0,
        }
    }

    /// Remove `id` and all its descendants from the arena and the index
    fn remove_subtree(&mut self, id: NodeId) -> usize {
        let mut removed = 0;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                if self.block_index.get(&node.block_id) == Some(&current) {
                    self.block_index.remove(&node.block_id);
                }
                stack.extend(node.children);
                removed += 1;
            }
        }
        removed
    }

    fn drop_stale_refs(&mut self) {
        let nodes = &self.nodes;
        self.last_inserted_block.retain(|_, id| nodes.contains_key(id));
        if let Some(head) = self.head {
            if !nodes.contains_key(&head) {
                self.head = None;
            }
        }
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }
}
