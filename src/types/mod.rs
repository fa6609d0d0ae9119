// Core types for RANDPA
// Principle: Opaque identifiers, explicit encodings

pub mod primitives;
pub mod signature;
pub mod keys;

pub use primitives::*;
pub use signature::*;
pub use keys::*;
