// Primitives - Block identifiers, digests and session handles
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block height as encoded by the host chain
pub type BlockNumber = u32;

/// Network session handle assigned by the transport layer
pub type SessionId = u32;

/// Universal digest (Blake3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash data with Blake3
    pub fn hash(data: &[u8]) -> Self {
        Digest(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for Digest {
    fn from(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }
}

/// Block identifier
///
/// The producing chain encodes the block height into the first four bytes
/// (big-endian); the remaining bytes are the block hash suffix.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId([u8; 32]);

impl BlockId {
    pub const ZERO: BlockId = BlockId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        BlockId(bytes)
    }

    /// Build an id for `height` whose suffix is taken from `hash`
    pub fn new(height: BlockNumber, hash: &Digest) -> Self {
        let mut bytes = *hash.as_bytes();
        bytes[..4].copy_from_slice(&height.to_be_bytes());
        BlockId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Height encoded in the id prefix
    pub fn height(&self) -> BlockNumber {
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&self.0[..4]);
        BlockNumber::from_be_bytes(prefix)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}:{}", self.height(), hex::encode(&self.0[4..10]))
    }
}

impl From<[u8; 32]> for BlockId {
    fn from(bytes: [u8; 32]) -> Self {
        BlockId(bytes)
    }
}
