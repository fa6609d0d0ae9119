// Inbound events - Everything the coordinator consumes from its queue

use super::messages::NetMessage;
use crate::types::keys::PublicKey;
use crate::types::primitives::{BlockId, SessionId};
use std::collections::BTreeSet;
use std::time::Instant;

/// A network message with its origin and arrival time
#[derive(Debug, Clone)]
pub struct NetEnvelope {
    pub session: SessionId,
    pub message: NetMessage,
    pub received_at: Instant,
}

impl NetEnvelope {
    pub fn new(session: SessionId, message: NetMessage) -> Self {
        Self {
            session,
            message,
            received_at: Instant::now(),
        }
    }
}

/// A block the host chain accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedBlock {
    pub block_id: BlockId,
    pub prev_block_id: BlockId,
    pub creator_key: PublicKey,
    pub active_bp_keys: BTreeSet<PublicKey>,
    /// The host is replaying history
    pub is_sync: bool,
}

/// Notifications from the host chain and transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    BlockAccepted(AcceptedBlock),
    BlockIrreversible { block_id: BlockId },
    NewPeer { session: SessionId },
}

/// Queue item of the coordinator
#[derive(Debug, Clone)]
pub enum RandpaMessage {
    Net(NetEnvelope),
    Event(ChainEvent),
}

impl From<NetEnvelope> for RandpaMessage {
    fn from(envelope: NetEnvelope) -> Self {
        RandpaMessage::Net(envelope)
    }
}

impl From<ChainEvent> for RandpaMessage {
    fn from(event: ChainEvent) -> Self {
        RandpaMessage::Event(event)
    }
}
