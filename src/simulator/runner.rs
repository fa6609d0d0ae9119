// Simulation runner - Event loop of the simulated network

use super::chain::{genesis_id, SimBlock, SimChain};
use super::{default_conf_number, Millis, NodeIndex, NodeKind};
use crate::cli::config::{ConfigError, RandpaConfig};
use crate::consensus::randpa::{ChainEvent, ForkTree, NetMessage, Randpa, RandpaStatus, VoterKeys};
use crate::node::integration::{
    ChannelFinality, ChannelNetwork, OutboundMessage, ProcessingMode, RandpaService,
};
use crate::types::keys::{PrivateKey, PublicKey};
use crate::types::primitives::{BlockId, BlockNumber, Digest, SessionId};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info_span};

/// Simulation settings
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub slot_ms: Millis,
    /// DPoS confirmation depth; derived from the producer count when unset
    pub conf_number: Option<u32>,
    pub randpa: RandpaConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            slot_ms: 500,
            conf_number: None,
            randpa: RandpaConfig {
                messages_cache_size: 4096,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start RANDPA service: {0}")]
    Service(#[from] std::io::Error),

    #[error("Unknown node {0}")]
    UnknownNode(NodeIndex),

    #[error("Node {0} cannot link to itself")]
    SelfLink(NodeIndex),
}

struct AttachedRandpa {
    service: RandpaService,
    outbound: UnboundedReceiver<OutboundMessage>,
    finalized: UnboundedReceiver<BlockId>,
}

/// One simulated node
pub struct SimNode {
    index: NodeIndex,
    kind: NodeKind,
    key: PrivateKey,
    chain: SimChain,
    randpa: Option<AttachedRandpa>,
}

impl SimNode {
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    pub fn chain(&self) -> &SimChain {
        &self.chain
    }

    pub fn lib_height(&self) -> BlockNumber {
        self.chain.lib().height()
    }

    pub fn head_height(&self) -> BlockNumber {
        self.chain.head().height()
    }

    pub fn has_randpa(&self) -> bool {
        self.randpa.is_some()
    }

    pub fn randpa_status(&self) -> Option<Arc<RandpaStatus>> {
        self.randpa.as_ref().map(|r| r.service.status())
    }

    pub fn is_frozen(&self) -> Option<bool> {
        self.randpa_status().map(|status| status.is_frozen())
    }

    pub fn with_randpa<R>(&self, f: impl FnOnce(&Randpa) -> R) -> Option<R> {
        self.randpa.as_ref()?.service.with_randpa(f)
    }
}

enum SimEvent {
    Produce { slot: u64 },
    Block { to: NodeIndex, block: SimBlock },
    Message { to: NodeIndex, from: NodeIndex, message: NetMessage },
}

struct Scheduled {
    at: Millis,
    seq: u64,
    event: SimEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Earliest first, then scheduling order
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Discrete-event simulation of a DPoS network
pub struct Simulator {
    config: SimConfig,
    nodes: Vec<SimNode>,
    /// Undirected links keyed by (lower, higher) index
    links: HashMap<(NodeIndex, NodeIndex), Millis>,
    events: BinaryHeap<Scheduled>,
    seq: u64,
    now: Millis,
    started: bool,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            links: HashMap::new(),
            events: BinaryHeap::new(),
            seq: 0,
            now: 0,
            started: false,
        }
    }

    /// `count` producers, all running RANDPA
    pub fn with_producers(count: usize, config: SimConfig) -> Result<Self, SimError> {
        let mut sim = Self::new(config);
        for _ in 0..count {
            sim.add_node(NodeKind::Producer, true)?;
        }
        Ok(sim)
    }

    pub fn add_node(&mut self, kind: NodeKind, with_randpa: bool) -> Result<NodeIndex, SimError> {
        let index = self.nodes.len();
        let key = node_key(index);
        let chain = SimChain::new(self.config.conf_number.unwrap_or(u32::MAX));

        let randpa = if with_randpa {
            let (network, outbound) = ChannelNetwork::channel();
            let (finality, finalized) = ChannelFinality::channel();
            let mut builder = self
                .config
                .randpa
                .builder(ForkTree::new(genesis_id()), Arc::new(network), Arc::new(finality))?
                .span(info_span!("node", id = index));
            if kind == NodeKind::Producer {
                builder = builder.voter(VoterKeys::from_private_keys(vec![key.clone()]));
            }
            let service = RandpaService::start(builder.build(), ProcessingMode::Inline)?;
            Some(AttachedRandpa {
                service,
                outbound,
                finalized,
            })
        } else {
            None
        };

        self.nodes.push(SimNode {
            index,
            kind,
            key,
            chain,
            randpa,
        });
        Ok(index)
    }

    /// Link two nodes, or change the delay of an existing link
    pub fn connect(&mut self, a: NodeIndex, b: NodeIndex, delay: Millis) -> Result<(), SimError> {
        for index in [a, b] {
            if index >= self.nodes.len() {
                return Err(SimError::UnknownNode(index));
            }
        }
        if a == b {
            return Err(SimError::SelfLink(a));
        }

        if self.links.insert(link_key(a, b), delay).is_some() {
            return Ok(());
        }

        for (local, remote) in [(a, b), (b, a)] {
            if let Some(randpa) = &self.nodes[local].randpa {
                randpa.service.on_new_peer(session_of(remote));
            }
            self.flush(local);
        }
        Ok(())
    }

    /// Connect along an adjacency list of `(peer, delay)` entries
    pub fn load_graph(&mut self, graph: &[Vec<(NodeIndex, Millis)>]) -> Result<(), SimError> {
        for (a, edges) in graph.iter().enumerate() {
            for &(b, delay) in edges {
                self.connect(a, b, delay)?;
            }
        }
        Ok(())
    }

    pub fn set_conf_number(&mut self, conf_number: u32) {
        self.config.conf_number = Some(conf_number);
        for node in &mut self.nodes {
            node.chain.set_conf_number(conf_number);
        }
    }

    pub fn slot_ms(&self) -> Millis {
        self.config.slot_ms
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    pub fn node(&self, index: NodeIndex) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn lib_heights(&self) -> Vec<BlockNumber> {
        self.nodes.iter().map(SimNode::lib_height).collect()
    }

    /// Process every event scheduled at or before `end`
    pub fn run_until(&mut self, end: Millis) {
        if !self.started {
            self.start();
        }

        while self.events.peek().is_some_and(|next| next.at <= end) {
            let Some(next) = self.events.pop() else {
                break;
            };
            self.now = next.at;
            match next.event {
                SimEvent::Produce { slot } => self.produce(slot),
                SimEvent::Block { to, block } => self.apply_block(to, block),
                SimEvent::Message { to, from, message } => self.deliver(to, from, message),
            }
        }
        self.now = self.now.max(end);
    }

    /// Run for `slots` more production slots
    pub fn run_slots(&mut self, slots: u64) {
        let end = self.now + slots * self.config.slot_ms;
        self.run_until(end);
    }

    fn start(&mut self) {
        self.started = true;
        if self.config.conf_number.is_none() {
            let producers = self.producers().len();
            let conf_number = default_conf_number(producers);
            for node in &mut self.nodes {
                node.chain.set_conf_number(conf_number);
            }
        }
        self.schedule(self.config.slot_ms, SimEvent::Produce { slot: 1 });
    }

    fn producers(&self) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Producer)
            .map(|n| n.index)
            .collect()
    }

    fn schedule(&mut self, delay: Millis, event: SimEvent) {
        self.seq += 1;
        self.events.push(Scheduled {
            at: self.now + delay,
            seq: self.seq,
            event,
        });
    }

    fn delay(&self, a: NodeIndex, b: NodeIndex) -> Option<Millis> {
        self.links.get(&link_key(a, b)).copied()
    }

    fn neighbors(&self, index: NodeIndex) -> Vec<(NodeIndex, Millis)> {
        let mut neighbors: Vec<_> = self
            .links
            .iter()
            .filter_map(|(&(a, b), &delay)| match index {
                i if i == a => Some((b, delay)),
                i if i == b => Some((a, delay)),
                _ => None,
            })
            .collect();
        neighbors.sort_unstable();
        neighbors
    }

    fn produce(&mut self, slot: u64) {
        self.schedule(self.config.slot_ms, SimEvent::Produce { slot: slot + 1 });

        let producers = self.producers();
        if producers.is_empty() {
            return;
        }
        let active: BTreeSet<PublicKey> = producers
            .iter()
            .map(|&i| self.nodes[i].public_key())
            .collect();
        let index = producers[((slot - 1) % producers.len() as u64) as usize];

        let node = &self.nodes[index];
        let block = SimBlock::new(node.chain.head(), node.public_key(), active, slot);
        debug!("slot {}: node {} produced {}", slot, index, block.id);
        self.apply_block(index, block);
    }

    fn apply_block(&mut self, index: NodeIndex, block: SimBlock) {
        let update = self.nodes[index].chain.apply(block);

        for (peer, delay) in self.neighbors(index) {
            for block in &update.accepted {
                self.schedule(
                    delay,
                    SimEvent::Block {
                        to: peer,
                        block: block.clone(),
                    },
                );
            }
        }

        if let Some(randpa) = &self.nodes[index].randpa {
            for block in &update.accepted {
                randpa
                    .service
                    .push(ChainEvent::BlockAccepted(block.accepted()).into());
            }
            if let Some(lib) = update.irreversible {
                randpa.service.on_irreversible_block(lib);
            }
        }
        self.flush(index);
    }

    fn deliver(&mut self, to: NodeIndex, from: NodeIndex, message: NetMessage) {
        let Some(randpa) = &self.nodes[to].randpa else {
            return;
        };
        randpa.service.on_net_message(session_of(from), message);
        self.flush(to);
    }

    /// Move a node's RANDPA output onto the network and into its chain
    fn flush(&mut self, index: NodeIndex) {
        loop {
            let mut outbound = Vec::new();
            let mut finalized = Vec::new();
            let Some(randpa) = self.nodes[index].randpa.as_mut() else {
                return;
            };
            while let Ok(message) = randpa.outbound.try_recv() {
                outbound.push(message);
            }
            while let Ok(block_id) = randpa.finalized.try_recv() {
                finalized.push(block_id);
            }
            if outbound.is_empty() && finalized.is_empty() {
                return;
            }

            for (session, message) in outbound {
                let to = session as NodeIndex;
                match self.delay(index, to) {
                    Some(delay) => self.schedule(
                        delay,
                        SimEvent::Message {
                            to,
                            from: index,
                            message,
                        },
                    ),
                    None => debug!("node {} has no link to session {}", index, session),
                }
            }

            let node = &mut self.nodes[index];
            for block_id in finalized {
                if let Some(lib) = node.chain.bft_finalize(&block_id) {
                    debug!("node {} finalized {}", index, lib);
                    if let Some(randpa) = &node.randpa {
                        randpa.service.on_irreversible_block(lib);
                    }
                }
            }
        }
    }
}

fn link_key(a: NodeIndex, b: NodeIndex) -> (NodeIndex, NodeIndex) {
    (a.min(b), a.max(b))
}

fn session_of(index: NodeIndex) -> SessionId {
    index as SessionId
}

/// Deterministic producer key of node `index`
fn node_key(index: NodeIndex) -> PrivateKey {
    let seed = Digest::hash(&(index as u64).to_le_bytes());
    PrivateKey::from_seed(*seed.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimConfig {
        SimConfig {
            slot_ms: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_scheduled_ordering() {
        let mut heap = BinaryHeap::new();
        for (at, seq) in [(5, 1), (1, 2), (5, 0), (3, 3)] {
            heap.push(Scheduled {
                at,
                seq,
                event: SimEvent::Produce { slot: 0 },
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|s| (s.at, s.seq))).collect();
        assert_eq!(order, vec![(1, 2), (3, 3), (5, 0), (5, 1)]);
    }

    #[test]
    fn test_connect_validation() {
        let mut sim = Simulator::with_producers(2, config()).unwrap();
        assert!(matches!(sim.connect(0, 5, 10), Err(SimError::UnknownNode(5))));
        assert!(matches!(sim.connect(1, 1, 10), Err(SimError::SelfLink(1))));
        sim.connect(0, 1, 10).unwrap();
        sim.connect(1, 0, 20).unwrap();
        assert_eq!(sim.delay(0, 1), Some(20));
    }

    #[test]
    fn test_round_robin_production() {
        let mut sim = Simulator::new(config());
        for _ in 0..3 {
            sim.add_node(NodeKind::Producer, false).unwrap();
        }
        sim.add_node(NodeKind::FullNode, false).unwrap();
        sim.load_graph(&[vec![(1, 5), (2, 5), (3, 5)]]).unwrap();

        sim.run_until(650);
        for node in sim.nodes() {
            assert_eq!(node.head_height(), 6);
        }

        let chain = sim.node(3).unwrap().chain();
        let producers: Vec<_> = (1..=6)
            .map(|h| {
                let id = chain.ancestor_at(&chain.head(), h).unwrap();
                chain.block(&id).unwrap().producer
            })
            .collect();
        let keys: Vec<_> = (0..3).map(|i| sim.node(i).unwrap().public_key()).collect();
        assert_eq!(producers, [&keys[..], &keys[..]].concat());
    }

    #[test]
    fn test_dpos_irreversibility_without_randpa() {
        let mut sim = Simulator::new(SimConfig {
            conf_number: Some(2),
            ..config()
        });
        for _ in 0..2 {
            sim.add_node(NodeKind::Producer, false).unwrap();
        }
        sim.connect(0, 1, 5).unwrap();

        sim.run_until(550);
        assert_eq!(sim.lib_heights(), vec![3, 3]);
    }

    #[test]
    fn test_isolated_nodes_fork() {
        let mut sim = Simulator::new(config());
        for _ in 0..2 {
            sim.add_node(NodeKind::Producer, false).unwrap();
        }

        sim.run_slots(4);
        // Each node only sees its own two blocks
        assert_eq!(sim.node(0).unwrap().head_height(), 2);
        assert_eq!(sim.node(1).unwrap().head_height(), 2);
        assert_ne!(sim.node(0).unwrap().chain().head(), sim.node(1).unwrap().chain().head());
    }
}
