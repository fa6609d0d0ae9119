// Consensus - Finality on top of DPoS block production
// Principle: Irreversibility is proven, not waited for.

pub mod randpa;
