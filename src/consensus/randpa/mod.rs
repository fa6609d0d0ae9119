// RANDPA Finality Gadget
//
// This module implements a Byzantine Fault Tolerant finality gadget inspired by GRANDPA
// that runs next to DPoS block production.
//
// Key properties:
// - Safety: a block is finalized only with strictly more than 2/3 of the active producers
// - Liveness: every two-block round may finalize the branch its primary built
// - Verifiability: each decision is backed by a proof any peer can check alone
//
// The finality process works in rounds of ROUND_WIDTH blocks:
// 1. Prevote: at the first block of a round, producers vote for the primary's branch
// 2. Precommit: at the prevote cutoff block, producers commit to the best prevoted block
// 3. Finalization: supermajority precommits form a proof and advance the lib

pub mod tree;
pub mod messages;
pub mod signer;
pub mod round;
pub mod events;
pub mod queue;
pub mod gadget;

pub use tree::{Chain, ForkTree, ForkTreeError, NodeId, TreeNode};
pub use messages::*;
pub use signer::{KeySigner, RemoteSigner, SignatureProvider, SignerError, VoterKeys};
pub use round::{Round, RoundError, RoundEvent, RoundState, VoteError};
pub use events::{AcceptedBlock, ChainEvent, NetEnvelope, RandpaMessage};
pub use queue::MessageQueue;
pub use gadget::{FinalitySink, NetworkSink, ProofError, Randpa, RandpaBuilder, RandpaStatus};

use crate::types::primitives::BlockId;

/// Finality configuration constants
pub mod config {
    /// Blocks per round
    pub const ROUND_WIDTH: u32 = 2;

    /// Position inside a round at which the prevote phase ends
    pub const PREVOTE_WIDTH: u32 = 1;

    /// Network messages older than this are dropped unprocessed (in milliseconds)
    pub const MSG_EXPIRATION_MS: u64 = 1000;

    /// How many of the latest proofs are kept to answer proof requests
    pub const PROOFS_CACHE_SIZE: usize = 2;

    /// Capacity of each seen-message cache
    pub const MESSAGES_CACHE_SIZE: usize = 100_000;

    /// Blocks the head may run ahead of the lib before the gadget freezes
    /// 2/3 * 102 producers * 12 blocks per slot * 2 rounds * 2 (additional)
    pub const MAX_FINALITY_LAG_BLOCKS: u32 = 69 * 12 * 2 * 2;

    /// Base of the network message type ids registered with the transport
    pub const NET_MESSAGE_TYPES_BASE: u32 = 100;

    /// Blocks older than this when accepted are treated as sync traffic (in seconds)
    pub const SYNC_LAG_SECS: u64 = 2;
}

/// Strict BFT supermajority: more than 2/3 of `total`
#[inline]
pub fn has_supermajority(count: usize, total: usize) -> bool {
    if total == 0 {
        return false;
    }
    count > 2 * total / 3
}

/// Round a block belongs to
#[inline]
pub fn round_num(block_id: &BlockId) -> u32 {
    block_id.height().saturating_sub(1) / config::ROUND_WIDTH
}

/// Position of a block inside its round
#[inline]
pub fn num_in_round(block_id: &BlockId) -> u32 {
    block_id.height().saturating_sub(1) % config::ROUND_WIDTH
}
