// Network Messages - Signed envelopes exchanged between finality gadgets
//
// Every message is `Signed<T>`: a payload plus one signature per voter key.
// The signed digest binds the payload bytes and the payload kind, so a
// signature over one message type can never be replayed as another.

use super::config;
use super::tree::Chain;
use crate::types::keys::PublicKey;
use crate::types::primitives::{BlockId, Digest};
use crate::types::signature::{domain_separate, Signature64, DOMAIN_RANDPA};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Maximum size accepted when decoding a wire message
pub const MAX_MESSAGE_SIZE: u64 = 4 * 1024 * 1024;

/// Static discriminant mixed into each payload digest
pub trait MessageKind {
    const KIND: &'static str;
}

/// Signature together with the key that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySignature {
    pub key: PublicKey,
    pub signature: Signature64,
}

/// Payload signed by one or more voter keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed<T> {
    pub data: T,
    pub signatures: Vec<KeySignature>,
}

/// Digest signed by voters for a payload
pub fn signing_digest<T: Serialize + MessageKind>(data: &T) -> Digest {
    let encoded = bincode::serialize(data).expect("Message serialization should not fail");

    let mut preimage = domain_separate(DOMAIN_RANDPA, Digest::hash(&encoded).as_bytes());
    preimage.extend_from_slice(Digest::hash(T::KIND.as_bytes()).as_bytes());
    Digest::hash(&preimage)
}

impl<T: Serialize + MessageKind> Signed<T> {
    pub fn new(data: T, signatures: Vec<KeySignature>) -> Self {
        Self { data, signatures }
    }

    pub fn digest(&self) -> Digest {
        signing_digest(&self.data)
    }

    /// Claimed signer keys, in signature order
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.signatures.iter().map(|s| s.key).collect()
    }

    /// True if the message carries at least one signature, no key signs
    /// twice, and every signature matches its key
    pub fn verify(&self) -> bool {
        if self.signatures.is_empty() {
            return false;
        }

        let distinct: BTreeSet<_> = self.signatures.iter().map(|s| s.key).collect();
        if distinct.len() != self.signatures.len() {
            return false;
        }

        let digest = self.digest();
        self.signatures
            .iter()
            .all(|s| s.key.verify(digest.as_bytes(), &s.signature))
    }
}

/// Initial greeting carrying the sender's lib
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub lib: BlockId,
}

/// Reply to a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub lib: BlockId,
}

/// First phase vote for a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prevote {
    pub round_num: u32,
    pub base_block: BlockId,
    pub blocks: Vec<BlockId>,
}

impl Prevote {
    pub fn chain(&self) -> Chain {
        Chain::new(self.base_block, self.blocks.clone())
    }
}

/// Second phase vote for the round's best block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precommit {
    pub round_num: u32,
    pub block_id: BlockId,
}

pub type PrevoteMsg = Signed<Prevote>;
pub type PrecommitMsg = Signed<Precommit>;

/// BFT certificate for one finalized block
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Proof {
    pub round_num: u32,
    pub best_block: BlockId,
    pub prevotes: Vec<PrevoteMsg>,
    pub precommits: Vec<PrecommitMsg>,
}

/// Announces that a round finalized `best_block`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityNotice {
    pub round_num: u32,
    pub best_block: BlockId,
}

/// Asks a peer to resend the proof of a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityProofRequest {
    pub round_num: u32,
}

pub type HandshakeMsg = Signed<Handshake>;
pub type HandshakeAckMsg = Signed<HandshakeAck>;
pub type ProofMsg = Signed<Proof>;
pub type FinalityNoticeMsg = Signed<FinalityNotice>;
pub type FinalityProofRequestMsg = Signed<FinalityProofRequest>;

impl MessageKind for Handshake {
    const KIND: &'static str = "randpa/handshake";
}

impl MessageKind for HandshakeAck {
    const KIND: &'static str = "randpa/handshake_ack";
}

impl MessageKind for Prevote {
    const KIND: &'static str = "randpa/prevote";
}

impl MessageKind for Precommit {
    const KIND: &'static str = "randpa/precommit";
}

impl MessageKind for Proof {
    const KIND: &'static str = "randpa/proof";
}

impl MessageKind for FinalityNotice {
    const KIND: &'static str = "randpa/finality_notice";
}

impl MessageKind for FinalityProofRequest {
    const KIND: &'static str = "randpa/finality_proof_request";
}

/// Every message kind a gadget sends or receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetMessage {
    Handshake(HandshakeMsg),
    HandshakeAck(HandshakeAckMsg),
    Prevote(PrevoteMsg),
    Precommit(PrecommitMsg),
    Proof(ProofMsg),
    FinalityNotice(FinalityNoticeMsg),
    FinalityProofRequest(FinalityProofRequestMsg),
}

impl NetMessage {
    /// Type id registered with the transport layer
    pub fn type_id(&self) -> u32 {
        let index = match self {
            NetMessage::Handshake(_) => 0,
            NetMessage::HandshakeAck(_) => 1,
            NetMessage::Prevote(_) => 2,
            NetMessage::Precommit(_) => 3,
            NetMessage::Proof(_) => 4,
            NetMessage::FinalityNotice(_) => 5,
            NetMessage::FinalityProofRequest(_) => 6,
        };
        config::NET_MESSAGE_TYPES_BASE + index
    }

    pub fn name(&self) -> &'static str {
        match self {
            NetMessage::Handshake(_) => "handshake",
            NetMessage::HandshakeAck(_) => "handshake_ack",
            NetMessage::Prevote(_) => "prevote",
            NetMessage::Precommit(_) => "precommit",
            NetMessage::Proof(_) => "proof",
            NetMessage::FinalityNotice(_) => "finality_notice",
            NetMessage::FinalityProofRequest(_) => "finality_proof_request",
        }
    }

    /// Content address over payload and signatures, used by the dedup caches
    pub fn id(&self) -> Digest {
        Digest::hash(&bincode::serialize(self).expect("Message serialization should not fail"))
    }

    /// Signatures of the wrapped message verify
    pub fn verify(&self) -> bool {
        match self {
            NetMessage::Handshake(msg) => msg.verify(),
            NetMessage::HandshakeAck(msg) => msg.verify(),
            NetMessage::Prevote(msg) => msg.verify(),
            NetMessage::Precommit(msg) => msg.verify(),
            NetMessage::Proof(msg) => msg.verify(),
            NetMessage::FinalityNotice(msg) => msg.verify(),
            NetMessage::FinalityProofRequest(msg) => msg.verify(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decode a payload received under transport type `type_id`
    pub fn decode_typed(type_id: u32, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let message = Self::decode(bytes)?;
        if message.type_id() != type_id {
            return Err(ProtocolError::TypeMismatch {
                expected: type_id,
                got: message.type_id(),
            });
        }
        Ok(message)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        use bincode::Options;

        if bytes.len() as u64 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }

        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(MAX_MESSAGE_SIZE)
            .deserialize(bytes)
            .map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

impl From<HandshakeMsg> for NetMessage {
    fn from(msg: HandshakeMsg) -> Self {
        NetMessage::Handshake(msg)
    }
}

impl From<HandshakeAckMsg> for NetMessage {
    fn from(msg: HandshakeAckMsg) -> Self {
        NetMessage::HandshakeAck(msg)
    }
}

impl From<PrevoteMsg> for NetMessage {
    fn from(msg: PrevoteMsg) -> Self {
        NetMessage::Prevote(msg)
    }
}

impl From<PrecommitMsg> for NetMessage {
    fn from(msg: PrecommitMsg) -> Self {
        NetMessage::Precommit(msg)
    }
}

impl From<ProofMsg> for NetMessage {
    fn from(msg: ProofMsg) -> Self {
        NetMessage::Proof(msg)
    }
}

impl From<FinalityNoticeMsg> for NetMessage {
    fn from(msg: FinalityNoticeMsg) -> Self {
        NetMessage::FinalityNotice(msg)
    }
}

impl From<FinalityProofRequestMsg> for NetMessage {
    fn from(msg: FinalityProofRequestMsg) -> Self {
        NetMessage::FinalityProofRequest(msg)
    }
}

/// Wire encoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Message type {got} delivered on channel {expected}")]
    TypeMismatch { expected: u32, got: u32 },
}
