// Keys - Producer/voter identities
use super::signature::Signature64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// PublicKey = Ed25519 verifying key (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        PublicKey(key.to_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| KeyError::InvalidHex)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| KeyError::InvalidLength(v.len()))?;
        Ok(PublicKey(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature produced by this key
    pub fn verify(&self, message: &[u8], signature: &Signature64) -> bool {
        let public_key = match VerifyingKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };

        let sig = Signature::from_bytes(signature.as_bytes());

        public_key.verify(message, &sig).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Ed25519 private key; never serialized
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn generate() -> Self {
        PrivateKey(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Deterministic key from a 32 byte seed (simulation and tests)
    pub fn from_seed(seed: [u8; 32]) -> Self {
        PrivateKey(SigningKey::from_bytes(&seed))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|_| KeyError::InvalidHex)?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| KeyError::InvalidLength(v.len()))?;
        Ok(Self::from_seed(seed))
    }

    /// Hex of the 32 byte seed
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_verifying_key(&self.0.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature64 {
        Signature64::from_bytes(self.0.sign(message).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PrivateKey({})", self.public_key())
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Key is not valid hex")]
    InvalidHex,

    #[error("Key must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = PrivateKey::from_seed([1u8; 32]);
        let sig = key.sign(b"digest");
        assert!(key.public_key().verify(b"digest", &sig));
        assert!(!key.public_key().verify(b"other", &sig));
    }

    #[test]
    fn test_wrong_key_rejects() {
        let a = PrivateKey::from_seed([1u8; 32]);
        let b = PrivateKey::from_seed([2u8; 32]);
        let sig = a.sign(b"digest");
        assert!(!b.public_key().verify(b"digest", &sig));
    }

    #[test]
    fn test_hex_roundtrip() {
        let key = PrivateKey::from_seed([9u8; 32]);
        let public = key.public_key();
        assert_eq!(PublicKey::from_hex(&public.to_hex()), Ok(public));
        assert_eq!(key.to_hex(), hex::encode([9u8; 32]));
        assert_eq!(
            PrivateKey::from_hex(&hex::encode([9u8; 32])).unwrap().public_key(),
            public
        );
    }

    #[test]
    fn test_hex_errors() {
        assert_eq!(PublicKey::from_hex("zz"), Err(KeyError::InvalidHex));
        assert_eq!(PublicKey::from_hex("abcd"), Err(KeyError::InvalidLength(2)));
    }
}
