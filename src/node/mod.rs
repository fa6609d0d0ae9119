// Node - Host side wiring of the RANDPA gadget
pub mod integration;

pub use integration::{
    forward_finality, seed_tree, BlockState, ChannelFinality, ChannelNetwork, HostChain,
    OutboundMessage, ProcessingMode, RandpaService,
};
