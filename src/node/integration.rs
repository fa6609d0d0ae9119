// Finality Integration - Connects the RANDPA gadget to a host chain and transport
//
// This module provides:
// - HostChain: what the gadget needs from the block producing chain
// - ChannelNetwork / ChannelFinality: fire-and-forget sinks over tokio channels
// - seed_tree: rebuilds the fork tree from the host's fork database
// - RandpaService: runs the coordinator on a worker thread or inline

use crate::consensus::randpa::{
    config, AcceptedBlock, ChainEvent, Chain, FinalitySink, ForkTree, ForkTreeError,
    MessageQueue, NetEnvelope, NetMessage, NetworkSink, ProtocolError, Randpa, RandpaMessage,
    RandpaStatus,
};
use crate::types::keys::PublicKey;
use crate::types::primitives::{BlockId, SessionId};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// =============================================================================
// HOST CHAIN
// =============================================================================

/// Block as seen by the host chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    pub id: BlockId,
    pub prev_id: BlockId,
    pub signing_key: PublicKey,
    pub active_producer_keys: BTreeSet<PublicKey>,
    pub timestamp: SystemTime,
}

impl BlockState {
    /// A block older than SYNC_LAG_SECS is being replayed, not produced live
    pub fn is_sync(&self, now: SystemTime) -> bool {
        now.duration_since(self.timestamp)
            .map(|age| age > Duration::from_secs(config::SYNC_LAG_SECS))
            .unwrap_or(false)
    }

    /// Acceptance event for this block
    pub fn accepted_event(&self, now: SystemTime) -> ChainEvent {
        ChainEvent::BlockAccepted(AcceptedBlock {
            block_id: self.id,
            prev_block_id: self.prev_id,
            creator_key: self.signing_key,
            active_bp_keys: self.active_producer_keys.clone(),
            is_sync: self.is_sync(now),
        })
    }
}

/// Interface of the block producing chain
pub trait HostChain: Send + Sync {
    fn last_irreversible_block_id(&self) -> BlockId;

    fn head_block_state(&self) -> Option<BlockState>;

    fn fetch_block_state_by_id(&self, id: &BlockId) -> Option<BlockState>;

    /// Treat `block_id` as final ahead of the DPoS schedule
    fn bft_finalize(&self, block_id: &BlockId);
}

/// Build a fork tree rooted at the host's lib holding its head branch
pub fn seed_tree(host: &dyn HostChain) -> Result<ForkTree, ForkTreeError> {
    let lib_id = host.last_irreversible_block_id();
    debug!("[RANDPA] initializing fork tree with lib {}", lib_id);
    let mut tree = ForkTree::new(lib_id);

    let mut blocks = Vec::new();
    let mut current = host.head_block_state();
    while let Some(state) = current {
        if state.id == lib_id {
            break;
        }
        current = host.fetch_block_state_by_id(&state.prev_id);
        blocks.push(state);
    }
    blocks.reverse();

    let mut base_block = lib_id;
    for state in &blocks {
        tree.insert(
            &Chain::new(base_block, vec![state.id]),
            state.signing_key,
            &state.active_producer_keys,
        )?;
        base_block = state.id;
    }

    debug!("[RANDPA] copied {} blocks into fork tree", blocks.len());
    Ok(tree)
}

/// Forward finality decisions to the host chain until the channel closes
pub async fn forward_finality(mut rx: mpsc::UnboundedReceiver<BlockId>, host: Arc<dyn HostChain>) {
    while let Some(block_id) = rx.recv().await {
        debug!("[RANDPA] finalizing {} on host chain", block_id);
        host.bft_finalize(&block_id);
    }
}

// =============================================================================
// OUTPUT SINKS
// =============================================================================

/// Outbound message with its destination session
pub type OutboundMessage = (SessionId, NetMessage);

/// Hands outbound messages to the transport over an unbounded channel
pub struct ChannelNetwork {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelNetwork {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl NetworkSink for ChannelNetwork {
    fn send(&self, session: SessionId, message: NetMessage) {
        if let Err(e) = self.tx.send((session, message)) {
            warn!("[RANDPA] failed to queue {} for session {}", e.0 .1.name(), session);
        }
    }
}

/// Publishes finality decisions over an unbounded channel
pub struct ChannelFinality {
    tx: mpsc::UnboundedSender<BlockId>,
}

impl ChannelFinality {
    pub fn new(tx: mpsc::UnboundedSender<BlockId>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BlockId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl FinalitySink for ChannelFinality {
    fn finalize(&self, block_id: BlockId) {
        if self.tx.send(block_id).is_err() {
            warn!("[RANDPA] finality channel closed, dropping {}", block_id);
        }
    }
}

// =============================================================================
// SERVICE
// =============================================================================

/// How the coordinator consumes its input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Dedicated worker thread fed through the message queue
    Threaded,
    /// Processed on the caller's thread (deterministic simulation)
    Inline,
}

enum Worker {
    Threaded(Option<JoinHandle<()>>),
    Inline(Mutex<Randpa>),
}

/// Owns a coordinator and feeds it host and network input
pub struct RandpaService {
    queue: Arc<MessageQueue<RandpaMessage>>,
    worker: Worker,
    status: Arc<RandpaStatus>,
}

impl RandpaService {
    pub fn start(mut randpa: Randpa, mode: ProcessingMode) -> std::io::Result<Self> {
        let queue = Arc::new(MessageQueue::new());
        let status = randpa.status();

        let worker = match mode {
            ProcessingMode::Threaded => {
                let consumer = Arc::clone(&queue);
                let handle = std::thread::Builder::new()
                    .name("randpa".to_string())
                    .spawn(move || {
                        while let Some(message) = consumer.next_wait() {
                            randpa.process(message);
                        }
                        debug!("[RANDPA] worker stopped");
                    })?;
                Worker::Threaded(Some(handle))
            }
            ProcessingMode::Inline => Worker::Inline(Mutex::new(randpa)),
        };

        info!("[RANDPA] service started ({:?})", mode);
        Ok(Self {
            queue,
            worker,
            status,
        })
    }

    /// Deliver one message or event to the coordinator
    pub fn push(&self, message: RandpaMessage) {
        match &self.worker {
            Worker::Threaded(_) => self.queue.push(message),
            Worker::Inline(randpa) => {
                if self.queue.is_terminated() {
                    return;
                }
                randpa
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .process(message);
            }
        }
    }

    pub fn on_accepted_block(&self, state: &BlockState) {
        self.push(state.accepted_event(SystemTime::now()).into());
    }

    pub fn on_irreversible_block(&self, block_id: BlockId) {
        self.push(ChainEvent::BlockIrreversible { block_id }.into());
    }

    pub fn on_new_peer(&self, session: SessionId) {
        self.push(ChainEvent::NewPeer { session }.into());
    }

    pub fn on_net_message(&self, session: SessionId, message: NetMessage) {
        self.push(NetEnvelope::new(session, message).into());
    }

    /// Entry point for the transport: `bytes` arrived on channel `type_id`
    pub fn on_wire_message(
        &self,
        session: SessionId,
        type_id: u32,
        bytes: &[u8],
    ) -> Result<(), ProtocolError> {
        let message = NetMessage::decode_typed(type_id, bytes)?;
        self.on_net_message(session, message);
        Ok(())
    }

    /// Run `f` against the coordinator; only available inline
    pub fn with_randpa<R>(&self, f: impl FnOnce(&Randpa) -> R) -> Option<R> {
        match &self.worker {
            Worker::Inline(randpa) => {
                Some(f(&*randpa.lock().unwrap_or_else(PoisonError::into_inner)))
            }
            Worker::Threaded(_) => None,
        }
    }

    pub fn status(&self) -> Arc<RandpaStatus> {
        Arc::clone(&self.status)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stop processing and join the worker
    pub fn stop(&mut self) {
        self.queue.terminate();
        if let Worker::Threaded(handle) = &mut self.worker {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    warn!("[RANDPA] worker thread panicked");
                }
            }
        }
    }
}

impl Drop for RandpaService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::randpa::{Handshake, RandpaBuilder, VoterKeys};
    use crate::types::keys::PrivateKey;
    use crate::types::primitives::Digest;
    use std::collections::HashMap;
    use std::time::Instant;

    fn block(height: u32) -> BlockId {
        BlockId::new(height, &Digest::hash(&height.to_le_bytes()))
    }

    struct MockHost {
        lib: BlockId,
        head: BlockId,
        blocks: HashMap<BlockId, BlockState>,
        finalized: Mutex<Vec<BlockId>>,
    }

    impl MockHost {
        /// Linear chain 0..=head produced by `key`, lib at `lib`
        fn linear(lib: u32, head: u32, key: PublicKey) -> Self {
            let active: BTreeSet<_> = [key].into_iter().collect();
            let blocks = (1..=head)
                .map(|h| {
                    let state = BlockState {
                        id: block(h),
                        prev_id: block(h - 1),
                        signing_key: key,
                        active_producer_keys: active.clone(),
                        timestamp: SystemTime::now(),
                    };
                    (state.id, state)
                })
                .collect();
            Self {
                lib: block(lib),
                head: block(head),
                blocks,
                finalized: Mutex::new(Vec::new()),
            }
        }
    }

    impl HostChain for MockHost {
        fn last_irreversible_block_id(&self) -> BlockId {
            self.lib
        }

        fn head_block_state(&self) -> Option<BlockState> {
            self.blocks.get(&self.head).cloned()
        }

        fn fetch_block_state_by_id(&self, id: &BlockId) -> Option<BlockState> {
            self.blocks.get(id).cloned()
        }

        fn bft_finalize(&self, block_id: &BlockId) {
            self.finalized.lock().unwrap().push(*block_id);
        }
    }

    #[test]
    fn test_is_sync() {
        let key = PrivateKey::from_seed([1u8; 32]).public_key();
        let now = SystemTime::now();
        let mut state = BlockState {
            id: block(1),
            prev_id: block(0),
            signing_key: key,
            active_producer_keys: BTreeSet::new(),
            timestamp: now,
        };
        assert!(!state.is_sync(now));
        state.timestamp = now - Duration::from_secs(3);
        assert!(state.is_sync(now));
        // Clock skew into the future is not sync
        state.timestamp = now + Duration::from_secs(3);
        assert!(!state.is_sync(now));
    }

    #[test]
    fn test_seed_tree_from_host() {
        let key = PrivateKey::from_seed([1u8; 32]).public_key();
        let host = MockHost::linear(2, 6, key);
        let tree = seed_tree(&host).unwrap();

        assert_eq!(tree.root_node().block_id, block(2));
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.head_node().block_id, block(6));
        assert_eq!(
            tree.get_branch(&block(6)).unwrap().blocks,
            vec![block(3), block(4), block(5), block(6)]
        );
        assert_eq!(tree.get(&block(4)).unwrap().creator_key, Some(key));
    }

    #[test]
    fn test_seed_tree_head_at_lib() {
        let key = PrivateKey::from_seed([1u8; 32]).public_key();
        let host = MockHost::linear(3, 3, key);
        let tree = seed_tree(&host).unwrap();
        assert_eq!(tree.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_finality() {
        let key = PrivateKey::from_seed([1u8; 32]).public_key();
        let host = Arc::new(MockHost::linear(0, 2, key));
        let (sink, rx) = ChannelFinality::channel();

        let task = tokio::spawn(forward_finality(rx, host.clone()));
        sink.finalize(block(1));
        sink.finalize(block(2));
        drop(sink);
        task.await.unwrap();

        assert_eq!(*host.finalized.lock().unwrap(), vec![block(1), block(2)]);
    }

    #[test]
    fn test_threaded_service_processes_and_stops() {
        let (network, mut outbound) = ChannelNetwork::channel();
        let (finality, _finalized) = ChannelFinality::channel();
        let randpa = RandpaBuilder::new(ForkTree::new(block(0)), Arc::new(network), Arc::new(finality))
            .voter(VoterKeys::from_private_keys(vec![PrivateKey::from_seed([1u8; 32])]))
            .build();
        let mut service = RandpaService::start(randpa, ProcessingMode::Threaded).unwrap();
        let status = service.status();

        service.on_new_peer(3);
        let deadline = Instant::now() + Duration::from_secs(5);
        while status.processed() < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(service.with_randpa(|r| r.lib()).is_none());
        service.stop();

        let (session, message) = outbound.try_recv().unwrap();
        assert_eq!(session, 3);
        assert!(matches!(message, NetMessage::Handshake(_)));
    }

    #[test]
    fn test_inline_service_wire_entry() {
        let (network, mut outbound) = ChannelNetwork::channel();
        let (finality, _finalized) = ChannelFinality::channel();
        let randpa = RandpaBuilder::new(ForkTree::new(block(0)), Arc::new(network), Arc::new(finality))
            .build();
        let service = RandpaService::start(randpa, ProcessingMode::Inline).unwrap();

        let peer = VoterKeys::from_private_keys(vec![PrivateKey::from_seed([2u8; 32])]);
        let handshake = NetMessage::from(peer.sign(Handshake { lib: block(0) }).unwrap());
        let bytes = handshake.encode().unwrap();

        assert!(service.on_wire_message(1, 101, &bytes).is_err());
        service.on_wire_message(1, handshake.type_id(), &bytes).unwrap();

        assert_eq!(service.with_randpa(|r| r.peers().len()), Some(1));
        assert!(matches!(outbound.try_recv(), Ok((1, NetMessage::HandshakeAck(_)))));
    }

    #[test]
    fn test_stopped_inline_service_ignores_input() {
        let (network, mut outbound) = ChannelNetwork::channel();
        let (finality, _finalized) = ChannelFinality::channel();
        let randpa = RandpaBuilder::new(ForkTree::new(block(0)), Arc::new(network), Arc::new(finality))
            .build();
        let mut service = RandpaService::start(randpa, ProcessingMode::Inline).unwrap();
        service.stop();
        service.on_new_peer(1);
        assert!(outbound.try_recv().is_err());
    }
}
