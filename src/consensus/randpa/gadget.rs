// RANDPA Gadget - Coordinator of the finality protocol
//
// The Randpa coordinator is responsible for:
// 1. Tracking candidate blocks in the fork tree
// 2. Starting rounds and closing their prevote phase on block boundaries
// 3. Gossiping votes to known peers
// 4. Validating, caching and replaying proofs
// 5. Suspending participation while syncing or when finality lags too far
//
// Every input arrives as a RandpaMessage and is processed to completion
// before the next one; the coordinator owns all of its state.

use super::config;
use super::events::{AcceptedBlock, ChainEvent, NetEnvelope, RandpaMessage};
use super::messages::*;
use super::round::{Round, RoundEvent, RoundState};
use super::signer::VoterKeys;
use super::tree::{Chain, ForkTree};
use super::{has_supermajority, num_in_round, round_num};
use crate::types::keys::PublicKey;
use crate::types::primitives::{BlockId, BlockNumber, Digest, SessionId};
use lru::LruCache;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Span};

/// Trait for delivering messages to peers
pub trait NetworkSink: Send + Sync {
    /// Unicast `message` to the peer behind `session`
    fn send(&self, session: SessionId, message: NetMessage);
}

/// Trait for publishing finality decisions to the host chain
pub trait FinalitySink: Send + Sync {
    fn finalize(&self, block_id: BlockId);
}

/// Proof validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    #[error("Proof for unknown block {0}")]
    UnknownBlock(BlockId),

    #[error("Vote signature does not verify")]
    InvalidSignature,

    #[error("Vote for round {got} inside proof of round {expected}")]
    WrongRound { expected: u32, got: u32 },

    #[error("Prevote does not include best block {0}")]
    BestBlockNotInPrevote(BlockId),

    #[error("Key {0} is not an active producer")]
    NotActiveProducer(PublicKey),

    #[error("Precommitter {0} has not prevoted")]
    NotPrevoted(PublicKey),

    #[error("Precommit for {got}, proof is for {best}")]
    PrecommitForOtherBlock { got: BlockId, best: BlockId },

    #[error("Only {precommitted} of {active} producers precommitted")]
    NoSupermajority { precommitted: usize, active: usize },
}

/// Coordinator summary readable from other threads
#[derive(Debug, Default)]
pub struct RandpaStatus {
    lib: AtomicU32,
    head: AtomicU32,
    last_proved: AtomicU32,
    syncing: AtomicBool,
    frozen: AtomicBool,
    processed: AtomicU64,
}

impl RandpaStatus {
    pub fn lib_height(&self) -> BlockNumber {
        self.lib.load(Ordering::Relaxed)
    }

    pub fn head_height(&self) -> BlockNumber {
        self.head.load(Ordering::Relaxed)
    }

    pub fn last_proved_height(&self) -> BlockNumber {
        self.last_proved.load(Ordering::Relaxed)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Relaxed)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }

    /// Messages and events processed so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

/// Builder for the coordinator
pub struct RandpaBuilder {
    tree: ForkTree,
    network: Arc<dyn NetworkSink>,
    finality: Arc<dyn FinalitySink>,
    voter: Option<VoterKeys>,
    span: Span,
    max_finality_lag_blocks: BlockNumber,
    message_expiration: Duration,
    messages_cache_size: usize,
    proofs_cache_size: usize,
}

impl RandpaBuilder {
    /// The tree root is taken as the initial lib
    pub fn new(tree: ForkTree, network: Arc<dyn NetworkSink>, finality: Arc<dyn FinalitySink>) -> Self {
        Self {
            tree,
            network,
            finality,
            voter: None,
            span: Span::none(),
            max_finality_lag_blocks: config::MAX_FINALITY_LAG_BLOCKS,
            message_expiration: Duration::from_millis(config::MSG_EXPIRATION_MS),
            messages_cache_size: config::MESSAGES_CACHE_SIZE,
            proofs_cache_size: config::PROOFS_CACHE_SIZE,
        }
    }

    /// Voter identity; an ephemeral non-producer key when unset
    pub fn voter(mut self, voter: VoterKeys) -> Self {
        self.voter = Some(voter);
        self
    }

    /// Span entered while processing each message
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn max_finality_lag_blocks(mut self, blocks: BlockNumber) -> Self {
        self.max_finality_lag_blocks = blocks;
        self
    }

    pub fn message_expiration(mut self, expiration: Duration) -> Self {
        self.message_expiration = expiration;
        self
    }

    pub fn messages_cache_size(mut self, size: usize) -> Self {
        self.messages_cache_size = size;
        self
    }

    pub fn proofs_cache_size(mut self, size: usize) -> Self {
        self.proofs_cache_size = size;
        self
    }

    pub fn build(self) -> Randpa {
        let cache_size = NonZeroUsize::new(self.messages_cache_size).unwrap_or(NonZeroUsize::MIN);
        let lib = self.tree.root_node().block_id;
        let voter = self.voter.unwrap_or_else(VoterKeys::ephemeral);

        info!(
            "[RANDPA] gadget created, lib: {}, key: {}, producer: {}",
            lib,
            voter.primary_key(),
            voter.is_producer()
        );

        let randpa = Randpa {
            tree: self.tree,
            round: None,
            voter: Arc::new(voter),
            lib,
            last_proved_block_num: 0,
            peers: BTreeMap::new(),
            peer_messages: LruCache::new(cache_size),
            self_messages: LruCache::new(cache_size),
            last_proofs: VecDeque::with_capacity(self.proofs_cache_size),
            proofs_cache_size: self.proofs_cache_size,
            is_syncing: false,
            is_frozen: false,
            max_finality_lag_blocks: self.max_finality_lag_blocks,
            message_expiration: self.message_expiration,
            network: self.network,
            finality: self.finality,
            status: Arc::new(RandpaStatus::default()),
            span: self.span,
        };
        randpa.publish_status();
        randpa
    }
}

/// The finality coordinator of one node
pub struct Randpa {
    tree: ForkTree,
    round: Option<Round>,
    voter: Arc<VoterKeys>,

    /// Last irreversible block
    lib: BlockId,
    last_proved_block_num: BlockNumber,

    /// Primary key of each peer -> its session
    peers: BTreeMap<PublicKey, SessionId>,

    /// Messages already broadcast to peers
    peer_messages: LruCache<Digest, ()>,

    /// Round messages already received
    self_messages: LruCache<Digest, ()>,

    /// Latest proofs first, kept to answer proof requests
    last_proofs: VecDeque<Proof>,
    proofs_cache_size: usize,

    is_syncing: bool,
    is_frozen: bool,
    max_finality_lag_blocks: BlockNumber,
    message_expiration: Duration,

    network: Arc<dyn NetworkSink>,
    finality: Arc<dyn FinalitySink>,
    status: Arc<RandpaStatus>,
    span: Span,
}

impl Randpa {
    /// Process one queued message or event to completion
    pub fn process(&mut self, message: RandpaMessage) {
        let span = self.span.clone();
        let _entered = span.enter();

        match message {
            RandpaMessage::Net(envelope) => self.process_net_msg(envelope),
            RandpaMessage::Event(event) => self.process_event(event),
        }

        self.status.processed.fetch_add(1, Ordering::Relaxed);
        self.publish_status();
    }

    pub fn lib(&self) -> BlockId {
        self.lib
    }

    pub fn last_proved_block_num(&self) -> BlockNumber {
        self.last_proved_block_num
    }

    pub fn tree(&self) -> &ForkTree {
        &self.tree
    }

    pub fn round(&self) -> Option<&Round> {
        self.round.as_ref()
    }

    pub fn peers(&self) -> &BTreeMap<PublicKey, SessionId> {
        &self.peers
    }

    pub fn last_proofs(&self) -> impl Iterator<Item = &Proof> {
        self.last_proofs.iter()
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing
    }

    pub fn is_frozen(&self) -> bool {
        self.is_frozen
    }

    pub fn voter(&self) -> &VoterKeys {
        &self.voter
    }

    pub fn status(&self) -> Arc<RandpaStatus> {
        Arc::clone(&self.status)
    }

    /// Check a proof against the fork tree
    pub fn validate_proof(&self, proof: &Proof) -> Result<(), ProofError> {
        let best_block = proof.best_block;
        let node = self
            .tree
            .get(&best_block)
            .ok_or(ProofError::UnknownBlock(best_block))?;
        let bp_keys = &node.active_bp_keys;

        let mut prevoted = BTreeSet::new();
        for prevote in &proof.prevotes {
            if !prevote.verify() {
                return Err(ProofError::InvalidSignature);
            }
            if prevote.data.round_num != proof.round_num {
                return Err(ProofError::WrongRound {
                    expected: proof.round_num,
                    got: prevote.data.round_num,
                });
            }
            if prevote.data.base_block != best_block && !prevote.data.blocks.contains(&best_block) {
                return Err(ProofError::BestBlockNotInPrevote(best_block));
            }
            for key in prevote.public_keys() {
                if !bp_keys.contains(&key) {
                    return Err(ProofError::NotActiveProducer(key));
                }
                prevoted.insert(key);
            }
        }

        let mut precommitted = BTreeSet::new();
        for precommit in &proof.precommits {
            if !precommit.verify() {
                return Err(ProofError::InvalidSignature);
            }
            if precommit.data.round_num != proof.round_num {
                return Err(ProofError::WrongRound {
                    expected: proof.round_num,
                    got: precommit.data.round_num,
                });
            }
            for key in precommit.public_keys() {
                if !prevoted.contains(&key) {
                    return Err(ProofError::NotPrevoted(key));
                }
                if precommit.data.block_id != best_block {
                    return Err(ProofError::PrecommitForOtherBlock {
                        got: precommit.data.block_id,
                        best: best_block,
                    });
                }
                if !bp_keys.contains(&key) {
                    return Err(ProofError::NotActiveProducer(key));
                }
                precommitted.insert(key);
            }
        }

        if !has_supermajority(precommitted.len(), bp_keys.len()) {
            return Err(ProofError::NoSupermajority {
                precommitted: precommitted.len(),
                active: bp_keys.len(),
            });
        }

        Ok(())
    }

    fn process_net_msg(&mut self, envelope: NetEnvelope) {
        let age = envelope.received_at.elapsed();
        if age > self.message_expiration {
            warn!(
                "[RANDPA] {} dropped, age: {}ms",
                envelope.message.name(),
                age.as_millis()
            );
            return;
        }

        if !envelope.message.verify() {
            debug!(
                "[RANDPA] {} from session {} has invalid signatures",
                envelope.message.name(),
                envelope.session
            );
            return;
        }

        let session = envelope.session;
        match envelope.message {
            NetMessage::Handshake(msg) => self.on_handshake(session, msg),
            NetMessage::HandshakeAck(msg) => self.on_handshake_ack(session, msg),
            message @ (NetMessage::Prevote(_) | NetMessage::Precommit(_)) => {
                self.process_round_msg(message)
            }
            NetMessage::Proof(msg) => self.on_proof(session, msg),
            NetMessage::FinalityNotice(msg) => self.on_finality_notice(session, msg),
            NetMessage::FinalityProofRequest(msg) => self.on_proof_request(session, msg),
        }
    }

    fn process_event(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::BlockAccepted(block) => self.on_accepted_block(block),
            ChainEvent::BlockIrreversible { block_id } => self.on_irreversible_block(block_id),
            ChainEvent::NewPeer { session } => self.on_new_peer(session),
        }
    }

    fn on_handshake(&mut self, session: SessionId, msg: HandshakeMsg) {
        let Some(key) = msg.public_keys().first().copied() else {
            return;
        };
        info!("[RANDPA] handshake from {}, session: {}", key, session);
        self.peers.insert(key, session);

        if let Some(ack) = self.signed(HandshakeAck { lib: self.lib }) {
            self.send(session, ack.into());
        }
    }

    fn on_handshake_ack(&mut self, session: SessionId, msg: HandshakeAckMsg) {
        let Some(key) = msg.public_keys().first().copied() else {
            return;
        };
        info!("[RANDPA] handshake ack from {}, session: {}", key, session);
        self.peers.insert(key, session);
    }

    fn on_new_peer(&mut self, session: SessionId) {
        debug!("[RANDPA] new peer, session: {}", session);
        if let Some(handshake) = self.signed(Handshake { lib: self.lib }) {
            self.send(session, handshake.into());
        }
    }

    fn process_round_msg(&mut self, message: NetMessage) {
        let msg_round = match &message {
            NetMessage::Prevote(msg) => msg.data.round_num,
            NetMessage::Precommit(msg) => msg.data.round_num,
            _ => return,
        };

        if self.is_syncing || self.is_frozen {
            debug!("[RANDPA] syncing or frozen, {} ignored", message.name());
            return;
        }

        let id = message.id();
        if self.self_messages.contains(&id) {
            return;
        }
        self.self_messages.put(id, ());

        if round_num(&self.tree.head_node().block_id) == msg_round {
            self.bcast(message.clone());
        }

        let Some(round) = self.round.as_mut() else {
            debug!("[RANDPA] no active round, {} ignored", message.name());
            return;
        };

        let result = match &message {
            NetMessage::Prevote(msg) => round.on_prevote(&mut self.tree, msg),
            NetMessage::Precommit(msg) => round.on_precommit(&self.tree, msg),
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!("[RANDPA] {} for round {} rejected: {}", message.name(), msg_round, e);
        }

        self.drain_round_events();
    }

    fn on_proof(&mut self, session: SessionId, msg: ProofMsg) {
        let proof = msg.data;
        let best_height = proof.best_block.height();
        debug!("[RANDPA] proof for round {} from session {}", proof.round_num, session);

        if self.last_proved_block_num >= best_height {
            debug!(
                "[RANDPA] skipping proof for {}, last proved block {} is higher",
                proof.best_block, self.last_proved_block_num
            );
            return;
        }

        if self.lib.height() >= best_height {
            debug!("[RANDPA] skipping proof for {}, lib {} is higher", proof.best_block, self.lib);
            return;
        }

        if let Some(round) = &self.round {
            if round.num() == proof.round_num && round.state() == RoundState::Done {
                debug!("[RANDPA] skipping proof, round {} is finished", round.num());
                return;
            }
        }

        if let Err(e) = self.validate_proof(&proof) {
            info!("[RANDPA] invalid proof from session {}: {}", session, e);
            return;
        }

        info!("✅ [RANDPA] validated proof for block {}", proof.best_block);

        if let Some(round) = self.round.as_mut() {
            if round.num() == proof.round_num {
                round.set_state(RoundState::Done);
            }
        }
        self.on_proof_gained(proof);
    }

    fn on_finality_notice(&mut self, session: SessionId, msg: FinalityNoticeMsg) {
        let notice = msg.data;
        debug!("[RANDPA] finality notice for block {}", notice.best_block);

        if self.is_active_bp(&notice.best_block)
            && notice.best_block.height() <= self.last_proved_block_num
        {
            debug!("[RANDPA] producer already has a proof for {}", notice.best_block);
            return;
        }

        if let Some(request) = self.signed(FinalityProofRequest {
            round_num: notice.round_num,
        }) {
            self.send(session, request.into());
        }
    }

    fn on_proof_request(&mut self, session: SessionId, msg: FinalityProofRequestMsg) {
        let round = msg.data.round_num;
        debug!("[RANDPA] proof request for round {} from session {}", round, session);

        let Some(proof) = self.last_proofs.iter().find(|p| p.round_num == round).cloned() else {
            return;
        };
        if let Some(reply) = self.signed(proof) {
            self.send(session, reply.into());
        }
    }

    fn on_accepted_block(&mut self, block: AcceptedBlock) {
        let block_id = block.block_id;
        debug!(
            "[RANDPA] block accepted: {}, creator: {}, producers: {}",
            block_id,
            block.creator_key,
            block.active_bp_keys.len()
        );

        let was_frozen = self.is_frozen;
        self.is_syncing = block.is_sync;
        self.is_frozen =
            block_id.height().saturating_sub(self.lib.height()) > self.max_finality_lag_blocks;
        if self.is_frozen != was_frozen {
            if self.is_frozen {
                warn!(
                    "❄️ [RANDPA] finality lags behind head by more than {} blocks, freezing",
                    self.max_finality_lag_blocks
                );
            } else {
                info!("[RANDPA] finality caught up, unfreezing");
            }
        }

        let chain = Chain::new(block.prev_block_id, vec![block_id]);
        if let Err(e) = self
            .tree
            .insert(&chain, block.creator_key, &block.active_bp_keys)
        {
            error!("[RANDPA] cannot insert block {} into tree: {}", block_id, e);
            return;
        }

        if self.is_syncing {
            debug!("[RANDPA] omitting block while syncing: {}", block_id);
            return;
        }
        if self.is_frozen {
            return;
        }

        if self.should_start_round(&block_id) {
            self.remove_round();
            if self.is_active_bp(&block_id) {
                self.new_round(round_num(&block_id), block.creator_key);
            }
        }

        if self.should_end_prevote(&block_id) {
            if let Some(round) = self.round.as_mut() {
                round.end_prevote(&self.tree);
            }
            self.drain_round_events();
        }
    }

    fn on_irreversible_block(&mut self, block_id: BlockId) {
        if block_id.height() <= self.tree.root_node().height() {
            warn!("[RANDPA] irreversible notification for old block {}", block_id);
            return;
        }
        self.update_lib(block_id);
    }

    fn should_start_round(&self, block_id: &BlockId) -> bool {
        if block_id.height() < 1 {
            return false;
        }
        match &self.round {
            Some(round) => round_num(block_id) > round.num(),
            None => true,
        }
    }

    fn should_end_prevote(&self, block_id: &BlockId) -> bool {
        match &self.round {
            Some(round) => {
                round_num(block_id) == round.num() && num_in_round(block_id) == config::PREVOTE_WIDTH
            }
            None => false,
        }
    }

    /// All voter keys are active producers at `block_id`
    fn is_active_bp(&self, block_id: &BlockId) -> bool {
        if !self.voter.is_producer() {
            return false;
        }
        match self.tree.get(block_id) {
            Some(node) => self
                .voter
                .public_keys()
                .iter()
                .all(|key| node.active_bp_keys.contains(key)),
            None => false,
        }
    }

    fn new_round(&mut self, num: u32, primary: PublicKey) {
        self.round = Some(Round::new(num, primary, Arc::clone(&self.voter), &mut self.tree));
        self.drain_round_events();
    }

    fn remove_round(&mut self) {
        self.peer_messages.clear();
        self.self_messages.clear();
        self.tree.remove_confirmations();
        self.round = None;
    }

    fn drain_round_events(&mut self) {
        let events = match self.round.as_mut() {
            Some(round) => round.drain_events(),
            None => return,
        };

        for event in events {
            match event {
                RoundEvent::Prevote(msg) => self.bcast(msg.into()),
                RoundEvent::Precommit(msg) => self.bcast(msg.into()),
                RoundEvent::Done => self.finish_round(),
            }
        }
    }

    fn finish_round(&mut self) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if !round.finish() {
            return;
        }

        let proof = match round.proof() {
            Ok(proof) => proof.clone(),
            Err(e) => {
                error!("[RANDPA] {}", e);
                return;
            }
        };

        info!(
            "🔒 [RANDPA] round {} reached supermajority, best block: {}",
            proof.round_num, proof.best_block
        );

        if self.lib.height() < proof.best_block.height() {
            let best_block = proof.best_block;
            self.on_proof_gained(proof);
            self.update_lib(best_block);
        }
    }

    fn on_proof_gained(&mut self, proof: Proof) {
        let notice = FinalityNotice {
            round_num: proof.round_num,
            best_block: proof.best_block,
        };

        self.last_proved_block_num = proof.best_block.height();
        self.last_proofs.push_front(proof);
        self.last_proofs.truncate(self.proofs_cache_size);

        self.finality.finalize(notice.best_block);

        if let Some(msg) = self.signed(notice) {
            self.bcast(msg.into());
        }
    }

    fn update_lib(&mut self, lib_id: BlockId) {
        match self.tree.find(&lib_id) {
            Some(node) => {
                if let Err(e) = self.tree.set_root(node) {
                    error!("[RANDPA] cannot re-root tree at {}: {}", lib_id, e);
                    return;
                }
            }
            None => self.tree.reset_root(lib_id),
        }
        self.lib = lib_id;
        debug!("[RANDPA] lib updated to {}, tree size: {}", lib_id, self.tree.len());
    }

    fn signed<T: Serialize + MessageKind>(&self, data: T) -> Option<Signed<T>> {
        match self.voter.sign(data) {
            Ok(msg) => Some(msg),
            Err(e) => {
                error!("[RANDPA] failed to sign {}: {}", T::KIND, e);
                None
            }
        }
    }

    fn send(&self, session: SessionId, message: NetMessage) {
        debug!("[RANDPA] sending {} to session {}", message.name(), session);
        self.network.send(session, message);
    }

    /// Send to every known peer, once per distinct message
    fn bcast(&mut self, message: NetMessage) {
        let id = message.id();
        if self.peer_messages.contains(&id) {
            return;
        }

        let sessions: BTreeSet<SessionId> = self.peers.values().copied().collect();
        for session in sessions {
            self.send(session, message.clone());
        }
        self.peer_messages.put(id, ());
    }

    fn publish_status(&self) {
        self.status.lib.store(self.lib.height(), Ordering::Relaxed);
        self.status
            .head
            .store(self.tree.head_node().height(), Ordering::Relaxed);
        self.status
            .last_proved
            .store(self.last_proved_block_num, Ordering::Relaxed);
        self.status.syncing.store(self.is_syncing, Ordering::Relaxed);
        self.status.frozen.store(self.is_frozen, Ordering::Relaxed);
    }
}
