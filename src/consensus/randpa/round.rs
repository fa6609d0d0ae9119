// Round - One prevote/precommit voting round
//
// State machine:
//   Init -> Prevote -> ReadyToPrecommit -> Precommit -> Done
//                 \            \                \
//                  +------------+----------------+--> Fail
//
// The round never owns the fork tree: every operation borrows it from the
// coordinator. Outgoing votes and completion are queued as RoundEvents and
// drained by the coordinator after each call.

use super::has_supermajority;
use super::messages::{Precommit, PrecommitMsg, Prevote, PrevoteMsg, Proof};
use super::signer::VoterKeys;
use super::tree::{ForkTree, NodeId, TreeNode};
use crate::types::keys::PublicKey;
use crate::types::primitives::BlockId;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// State of a voting round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Created, own prevote not yet cast
    Init,
    /// Collecting prevotes
    Prevote,
    /// A block gained supermajority prevotes
    ReadyToPrecommit,
    /// Collecting precommits for the best block
    Precommit,
    /// Supermajority precommits gathered
    Done,
    /// Round ended without a decision
    Fail,
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoundState::Init => write!(f, "init"),
            RoundState::Prevote => write!(f, "prevote"),
            RoundState::ReadyToPrecommit => write!(f, "ready_to_precommit"),
            RoundState::Precommit => write!(f, "precommit"),
            RoundState::Done => write!(f, "done"),
            RoundState::Fail => write!(f, "fail"),
        }
    }
}

/// Output of a round, consumed by the coordinator
#[derive(Debug, Clone)]
pub enum RoundEvent {
    /// Own prevote to broadcast
    Prevote(PrevoteMsg),
    /// Own precommit to broadcast
    Precommit(PrecommitMsg),
    /// Supermajority precommits reached
    Done,
}

/// Why a vote was not accepted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoteError {
    #[error("Vote not accepted in state {0}")]
    UnexpectedState(RoundState),

    #[error("Vote for round {got}, expected {expected}")]
    WrongRound { expected: u32, got: u32 },

    #[error("Key {0} already prevoted")]
    AlreadyPrevoted(PublicKey),

    #[error("Key {0} already precommitted")]
    AlreadyPrecommitted(PublicKey),

    #[error("Prevote for unknown blocks")]
    UnknownBlocks,

    #[error("Key {key} is not an active producer at {block}")]
    NotActiveProducer { key: PublicKey, block: BlockId },

    #[error("Precommit for {got} but best block is {best}")]
    NotBestBlock { got: BlockId, best: BlockId },

    #[error("Key {0} precommitted without prevoting the best block")]
    NotPrevoted(PublicKey),

    #[error("Best block {0} is no longer in the tree")]
    BestNodePruned(BlockId),
}

/// Round result errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoundError {
    #[error("Round {num} has no proof in state {state}")]
    NotDone { num: u32, state: RoundState },
}

/// One voting round
#[derive(Debug)]
pub struct Round {
    num: u32,
    primary: PublicKey,
    state: RoundState,
    proof: Proof,

    /// Fixed once the prevote supermajority is reached
    best_node: Option<NodeId>,
    best_block: Option<BlockId>,

    voter: Arc<VoterKeys>,
    prevoted_keys: BTreeSet<PublicKey>,
    precommited_keys: BTreeSet<PublicKey>,
    events: VecDeque<RoundEvent>,
}

impl Round {
    /// Start round `num` and cast the prevote for `primary`'s latest branch
    pub fn new(num: u32, primary: PublicKey, voter: Arc<VoterKeys>, tree: &mut ForkTree) -> Self {
        debug!("[RANDPA] round started, num: {}, primary: {}", num, primary);

        let mut round = Self {
            num,
            primary,
            state: RoundState::Init,
            proof: Proof::default(),
            best_node: None,
            best_block: None,
            voter,
            prevoted_keys: BTreeSet::new(),
            precommited_keys: BTreeSet::new(),
            events: VecDeque::new(),
        };
        round.prevote(tree);
        round
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn primary(&self) -> PublicKey {
        self.primary
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn set_state(&mut self, state: RoundState) {
        self.state = state;
    }

    pub fn best_block(&self) -> Option<BlockId> {
        self.best_block
    }

    /// Proof of a finished round
    pub fn proof(&self) -> Result<&Proof, RoundError> {
        if self.state != RoundState::Done {
            return Err(RoundError::NotDone {
                num: self.num,
                state: self.state,
            });
        }
        Ok(&self.proof)
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<RoundEvent> {
        self.events.drain(..).collect()
    }

    /// Handle a prevote from a peer
    pub fn on_prevote(&mut self, tree: &mut ForkTree, msg: &PrevoteMsg) -> Result<(), VoteError> {
        if !matches!(self.state, RoundState::Prevote | RoundState::ReadyToPrecommit) {
            return Err(VoteError::UnexpectedState(self.state));
        }

        self.validate_prevote(tree, msg)?;
        self.add_prevote(tree, msg);
        Ok(())
    }

    /// Handle a precommit from a peer
    pub fn on_precommit(&mut self, tree: &ForkTree, msg: &PrecommitMsg) -> Result<(), VoteError> {
        if !matches!(self.state, RoundState::Precommit | RoundState::ReadyToPrecommit) {
            return Err(VoteError::UnexpectedState(self.state));
        }

        self.validate_precommit(tree, msg)?;
        self.add_precommit(tree, msg);
        Ok(())
    }

    /// Close the prevote phase; fails the round without a prevote supermajority
    pub fn end_prevote(&mut self, tree: &ForkTree) {
        if self.state == RoundState::Done {
            return;
        }

        if self.state != RoundState::ReadyToPrecommit {
            debug!("[RANDPA] round failed, num: {}, state: {}", self.num, self.state);
            self.state = RoundState::Fail;
            return;
        }

        let best = match self.best(tree) {
            Some(node) => node,
            None => {
                warn!("[RANDPA] best block of round {} was pruned, failing round", self.num);
                self.state = RoundState::Fail;
                return;
            }
        };

        debug!("[RANDPA] prevote finished for round {}, best block: {}", self.num, best.block_id);
        self.seal_prevotes(best);
        self.precommit(tree);
    }

    /// True if the round reached Done; any other state becomes Fail
    pub fn finish(&mut self) -> bool {
        if self.state != RoundState::Done {
            debug!("[RANDPA] round failed, num: {}, state: {}", self.num, self.state);
            self.state = RoundState::Fail;
            return false;
        }
        true
    }

    fn prevote(&mut self, tree: &mut ForkTree) {
        self.state = RoundState::Prevote;

        let last_block = match tree
            .last_inserted_block(&self.primary)
            .and_then(|id| tree.node(id))
        {
            Some(node) => node.block_id,
            None => {
                warn!("[RANDPA] no block in tree for primary {}", self.primary);
                return;
            }
        };

        let chain = match tree.get_branch(&last_block) {
            Ok(chain) => chain,
            Err(e) => {
                error!("[RANDPA] cannot build branch for prevote: {}", e);
                return;
            }
        };

        let prevote = Prevote {
            round_num: self.num,
            base_block: chain.base_block,
            blocks: chain.blocks,
        };
        let msg = match self.voter.sign(prevote) {
            Ok(msg) => msg,
            Err(e) => {
                error!("[RANDPA] failed to sign prevote: {}", e);
                return;
            }
        };

        self.add_prevote(tree, &msg);
        self.events.push_back(RoundEvent::Prevote(msg));
    }

    fn precommit(&mut self, tree: &ForkTree) {
        self.state = RoundState::Precommit;

        let best_block = match self.best_block {
            Some(block) => block,
            None => return,
        };

        let msg = match self.voter.sign(Precommit {
            round_num: self.num,
            block_id: best_block,
        }) {
            Ok(msg) => msg,
            Err(e) => {
                error!("[RANDPA] failed to sign precommit: {}", e);
                return;
            }
        };

        self.events.push_back(RoundEvent::Precommit(msg.clone()));
        self.add_precommit(tree, &msg);
    }

    fn validate_prevote(&self, tree: &ForkTree, msg: &PrevoteMsg) -> Result<(), VoteError> {
        if msg.data.round_num != self.num {
            return Err(VoteError::WrongRound {
                expected: self.num,
                got: msg.data.round_num,
            });
        }

        let keys = msg.public_keys();
        if let Some(key) = keys.iter().find(|k| self.prevoted_keys.contains(*k)) {
            return Err(VoteError::AlreadyPrevoted(*key));
        }

        let node = self
            .find_last_node(tree, &msg.data.base_block, &msg.data.blocks)
            .ok_or(VoteError::UnknownBlocks)?;

        if let Some(key) = keys.iter().find(|k| !node.active_bp_keys.contains(*k)) {
            return Err(VoteError::NotActiveProducer {
                key: *key,
                block: node.block_id,
            });
        }

        Ok(())
    }

    fn validate_precommit(&self, tree: &ForkTree, msg: &PrecommitMsg) -> Result<(), VoteError> {
        if msg.data.round_num != self.num {
            return Err(VoteError::WrongRound {
                expected: self.num,
                got: msg.data.round_num,
            });
        }

        let keys = msg.public_keys();
        if let Some(key) = keys.iter().find(|k| self.precommited_keys.contains(*k)) {
            return Err(VoteError::AlreadyPrecommitted(*key));
        }

        let best_block = self.best_block.ok_or(VoteError::UnexpectedState(self.state))?;
        if msg.data.block_id != best_block {
            return Err(VoteError::NotBestBlock {
                got: msg.data.block_id,
                best: best_block,
            });
        }

        let best = self
            .best(tree)
            .ok_or(VoteError::BestNodePruned(best_block))?;
        if let Some(key) = keys.iter().find(|k| !best.has_confirmation(k)) {
            return Err(VoteError::NotPrevoted(*key));
        }

        Ok(())
    }

    fn add_prevote(&mut self, tree: &mut ForkTree, msg: &PrevoteMsg) {
        let chain = msg.data.chain();
        let confirmation = Arc::new(msg.clone());

        for key in msg.public_keys() {
            let max_node = match tree.add_confirmations(&chain, key, Arc::clone(&confirmation)) {
                Some(id) => id,
                None => {
                    error!("[RANDPA] prevote of round {} is not insertable", self.num);
                    return;
                }
            };
            self.prevoted_keys.insert(key);

            let node = match tree.node(max_node) {
                Some(node) => node,
                None => continue,
            };
            debug!(
                "[RANDPA] prevote inserted, round: {}, from: {}, max confirmations: {}",
                self.num,
                key,
                node.confirmation_number()
            );

            if self.state == RoundState::Prevote
                && has_supermajority(node.confirmation_number(), node.active_bp_keys.len())
            {
                self.state = RoundState::ReadyToPrecommit;
                self.best_node = Some(max_node);
                self.best_block = Some(node.block_id);
                self.proof.round_num = self.num;
                self.proof.best_block = node.block_id;
                debug!(
                    "[RANDPA] prevote threshold reached, round: {}, best block: {}",
                    self.num, node.block_id
                );
            }
        }
    }

    fn add_precommit(&mut self, tree: &ForkTree, msg: &PrecommitMsg) {
        let best = match self.best(tree) {
            Some(node) => node,
            None => return,
        };
        let active = best.active_bp_keys.len();

        for key in msg.public_keys() {
            self.precommited_keys.insert(key);
            self.proof.precommits.push(msg.clone());
            debug!("[RANDPA] precommit inserted, round: {}, from: {}", self.num, key);

            if has_supermajority(self.proof.precommits.len(), active) {
                if self.proof.prevotes.is_empty() {
                    self.seal_prevotes(best);
                }
                debug!(
                    "[RANDPA] precommit threshold reached, round: {}, best block: {}",
                    self.num, best.block_id
                );
                self.state = RoundState::Done;
                self.events.push_back(RoundEvent::Done);
                return;
            }
        }
    }

    /// Copy the best node's prevotes into the proof
    fn seal_prevotes(&mut self, best: &TreeNode) {
        self.proof.round_num = self.num;
        self.proof.best_block = best.block_id;
        self.proof.prevotes = best
            .confirmation_data
            .values()
            .map(|msg| (**msg).clone())
            .collect();
    }

    fn best<'a>(&self, tree: &'a ForkTree) -> Option<&'a TreeNode> {
        self.best_node
            .and_then(|id| tree.node(id))
            .filter(|node| Some(node.block_id) == self.best_block)
    }

    /// Last known block of a prevote, scanning from its tip down to the base
    fn find_last_node<'a>(
        &self,
        tree: &'a ForkTree,
        base_block: &BlockId,
        blocks: &[BlockId],
    ) -> Option<&'a TreeNode> {
        blocks
            .iter()
            .rev()
            .find_map(|block_id| tree.get(block_id))
            .or_else(|| tree.get(base_block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::randpa::tree::Chain;
    use crate::types::keys::PrivateKey;
    use crate::types::primitives::Digest;

    fn block(height: u32) -> BlockId {
        BlockId::new(height, &Digest::hash(&height.to_le_bytes()))
    }

    fn voter(seed: u8) -> Arc<VoterKeys> {
        Arc::new(VoterKeys::from_private_keys(vec![PrivateKey::from_seed([seed; 32])]))
    }

    struct Fixture {
        tree: ForkTree,
        voters: Vec<Arc<VoterKeys>>,
    }

    /// `n` producers, block 1 and 2 built by producer 0 on top of root 0
    fn fixture(n: u8) -> Fixture {
        let voters: Vec<_> = (1..=n).map(voter).collect();
        let active: BTreeSet<_> = voters.iter().map(|v| v.primary_key()).collect();
        let mut tree = ForkTree::new(block(0));
        tree.insert(
            &Chain::new(block(0), vec![block(1), block(2)]),
            voters[0].primary_key(),
            &active,
        )
        .unwrap();
        Fixture { tree, voters }
    }

    fn prevote_from(voter: &VoterKeys, round_num: u32, blocks: Vec<BlockId>) -> PrevoteMsg {
        voter
            .sign(Prevote { round_num, base_block: block(0), blocks })
            .unwrap()
    }

    fn precommit_from(voter: &VoterKeys, round_num: u32, block_id: BlockId) -> PrecommitMsg {
        voter.sign(Precommit { round_num, block_id }).unwrap()
    }

    fn start(f: &mut Fixture) -> Round {
        Round::new(0, f.voters[0].primary_key(), Arc::clone(&f.voters[0]), &mut f.tree)
    }

    #[test]
    fn test_round_prevotes_on_creation() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        assert_eq!(round.state(), RoundState::Prevote);

        let events = round.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            RoundEvent::Prevote(msg) => {
                assert_eq!(msg.data.blocks, vec![block(1), block(2)]);
                assert_eq!(msg.data.base_block, block(0));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.tree.get(&block(2)).unwrap().confirmation_number(), 1);
        assert!(round.drain_events().is_empty());
    }

    #[test]
    fn test_round_without_primary_block_stays_silent() {
        let mut f = fixture(4);
        let stranger = voter(99);
        let mut round = Round::new(0, stranger.primary_key(), stranger, &mut f.tree);
        assert_eq!(round.state(), RoundState::Prevote);
        assert!(round.drain_events().is_empty());
    }

    #[test]
    fn test_prevote_supermajority() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        let blocks = vec![block(1), block(2)];

        round
            .on_prevote(&mut f.tree, &prevote_from(&f.voters[1], 0, blocks.clone()))
            .unwrap();
        assert_eq!(round.state(), RoundState::Prevote);

        round
            .on_prevote(&mut f.tree, &prevote_from(&f.voters[2], 0, blocks))
            .unwrap();
        assert_eq!(round.state(), RoundState::ReadyToPrecommit);
        assert_eq!(round.best_block(), Some(block(2)));
    }

    #[test]
    fn test_best_block_fixed_once() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        let blocks = vec![block(1), block(2)];
        for v in &f.voters[1..3] {
            round.on_prevote(&mut f.tree, &prevote_from(v, 0, blocks.clone())).unwrap();
        }
        assert_eq!(round.best_block(), Some(block(2)));

        // A later prevote for a shorter chain still counts but does not move best
        round
            .on_prevote(&mut f.tree, &prevote_from(&f.voters[3], 0, vec![block(1)]))
            .unwrap();
        assert_eq!(round.state(), RoundState::ReadyToPrecommit);
        assert_eq!(round.best_block(), Some(block(2)));
    }

    #[test]
    fn test_prevote_rejections() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        let blocks = vec![block(1), block(2)];

        assert_eq!(
            round.on_prevote(&mut f.tree, &prevote_from(&f.voters[1], 5, blocks.clone())),
            Err(VoteError::WrongRound { expected: 0, got: 5 })
        );

        assert_eq!(
            round.on_prevote(&mut f.tree, &prevote_from(&f.voters[0], 0, blocks.clone())),
            Err(VoteError::AlreadyPrevoted(f.voters[0].primary_key()))
        );

        let outsider = voter(42);
        assert_eq!(
            round.on_prevote(&mut f.tree, &prevote_from(&outsider, 0, blocks)),
            Err(VoteError::NotActiveProducer {
                key: outsider.primary_key(),
                block: block(2)
            })
        );

        let unknown = f.voters[1]
            .sign(Prevote {
                round_num: 0,
                base_block: block(50),
                blocks: vec![block(51)],
            })
            .unwrap();
        assert_eq!(round.on_prevote(&mut f.tree, &unknown), Err(VoteError::UnknownBlocks));
    }

    #[test]
    fn test_end_prevote_without_threshold_fails() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        round.end_prevote(&f.tree);
        assert_eq!(round.state(), RoundState::Fail);
        assert!(!round.finish());
        assert!(matches!(round.proof(), Err(RoundError::NotDone { .. })));
    }

    #[test]
    fn test_full_round() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        let blocks = vec![block(1), block(2)];
        for v in &f.voters[1..3] {
            round.on_prevote(&mut f.tree, &prevote_from(v, 0, blocks.clone())).unwrap();
        }
        round.drain_events();

        round.end_prevote(&f.tree);
        assert_eq!(round.state(), RoundState::Precommit);
        let events = round.drain_events();
        assert!(matches!(&events[..], [RoundEvent::Precommit(msg)] if msg.data.block_id == block(2)));

        round
            .on_precommit(&f.tree, &precommit_from(&f.voters[1], 0, block(2)))
            .unwrap();
        assert_eq!(round.state(), RoundState::Precommit);
        round
            .on_precommit(&f.tree, &precommit_from(&f.voters[2], 0, block(2)))
            .unwrap();
        assert_eq!(round.state(), RoundState::Done);
        assert!(matches!(&round.drain_events()[..], [RoundEvent::Done]));

        assert!(round.finish());
        let proof = round.proof().unwrap();
        assert_eq!(proof.round_num, 0);
        assert_eq!(proof.best_block, block(2));
        assert_eq!(proof.prevotes.len(), 3);
        assert_eq!(proof.precommits.len(), 3);
    }

    #[test]
    fn test_precommit_rejections() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        let blocks = vec![block(1), block(2)];
        for v in &f.voters[1..3] {
            round.on_prevote(&mut f.tree, &prevote_from(v, 0, blocks.clone())).unwrap();
        }
        round.end_prevote(&f.tree);

        assert_eq!(
            round.on_precommit(&f.tree, &precommit_from(&f.voters[1], 0, block(1))),
            Err(VoteError::NotBestBlock { got: block(1), best: block(2) })
        );
        assert_eq!(
            round.on_precommit(&f.tree, &precommit_from(&f.voters[3], 0, block(2))),
            Err(VoteError::NotPrevoted(f.voters[3].primary_key()))
        );
        assert_eq!(
            round.on_precommit(&f.tree, &precommit_from(&f.voters[0], 0, block(2))),
            Err(VoteError::AlreadyPrecommitted(f.voters[0].primary_key()))
        );
        assert_eq!(
            round.on_precommit(&f.tree, &precommit_from(&f.voters[1], 1, block(2))),
            Err(VoteError::WrongRound { expected: 0, got: 1 })
        );
    }

    #[test]
    fn test_precommit_before_prevote_phase_ends() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        assert_eq!(
            round.on_precommit(&f.tree, &precommit_from(&f.voters[1], 0, block(2))),
            Err(VoteError::UnexpectedState(RoundState::Prevote))
        );
    }

    #[test]
    fn test_done_from_ready_to_precommit_keeps_proof() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        let blocks = vec![block(1), block(2)];
        for v in &f.voters[1..4] {
            round.on_prevote(&mut f.tree, &prevote_from(v, 0, blocks.clone())).unwrap();
        }
        for v in &f.voters[1..4] {
            round.on_precommit(&f.tree, &precommit_from(v, 0, block(2))).unwrap();
        }
        assert_eq!(round.state(), RoundState::Done);

        // The late prevote cutoff does not undo a finished round
        round.end_prevote(&f.tree);
        assert!(round.finish());
        let proof = round.proof().unwrap();
        assert_eq!(proof.best_block, block(2));
        assert_eq!(proof.prevotes.len(), 4);
    }

    #[test]
    fn test_single_voter_finishes_alone() {
        let mut f = fixture(1);
        let mut round = start(&mut f);
        assert_eq!(round.state(), RoundState::ReadyToPrecommit);

        round.end_prevote(&f.tree);
        assert_eq!(round.state(), RoundState::Done);
        let events = round.drain_events();
        assert!(matches!(events.last(), Some(RoundEvent::Done)));
        assert_eq!(round.proof().unwrap().precommits.len(), 1);
    }

    #[test]
    fn test_pruned_best_block_fails_round() {
        let mut f = fixture(4);
        let mut round = start(&mut f);
        let blocks = vec![block(1), block(2)];
        for v in &f.voters[1..3] {
            round.on_prevote(&mut f.tree, &prevote_from(v, 0, blocks.clone())).unwrap();
        }
        f.tree.reset_root(block(10));
        round.end_prevote(&f.tree);
        assert_eq!(round.state(), RoundState::Fail);
    }
}
