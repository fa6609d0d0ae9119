// RANDPA - BFT finality gadget for DPoS chains
// Principle: Agreement first, then irreversibility

pub mod cli;
pub mod consensus;
pub mod node;
pub mod simulator;
pub mod types;

#[cfg(test)]
mod tests;
