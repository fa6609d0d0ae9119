// Simulator - Deterministic discrete-event network of DPoS nodes
//
// Every node keeps its own SimChain and may run a RANDPA coordinator inline.
// Blocks and RANDPA messages travel over undirected links with fixed delays;
// producers take turns every slot.

pub mod chain;
pub mod runner;

pub use chain::{genesis_id, ChainUpdate, SimBlock, SimChain};
pub use runner::{SimConfig, SimError, SimNode, Simulator};

/// Index of a node inside the simulation
pub type NodeIndex = usize;

/// Simulated time in milliseconds
pub type Millis = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Takes part in the production schedule and votes
    Producer,
    /// Relays blocks and messages only
    FullNode,
}

/// DPoS confirmation depth used when none is configured: two thirds of the
/// producers plus one, twice
pub fn default_conf_number(producers: usize) -> u32 {
    let producers = u32::try_from(producers).unwrap_or(u32::MAX);
    (producers.saturating_mul(2) / 3 + 1).saturating_mul(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_conf_number() {
        assert_eq!(default_conf_number(3), 6);
        assert_eq!(default_conf_number(10), 14);
        assert_eq!(default_conf_number(21), 30);
    }
}
