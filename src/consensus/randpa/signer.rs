// Signers - Signing capabilities bound to a voter identity
//
// A voter is one or more signature providers. Each provider signs a digest
// with the key it announces; a vote is valid only when every provider signed.

use super::messages::{signing_digest, KeySignature, MessageKind, Signed};
use crate::types::keys::{PrivateKey, PublicKey};
use crate::types::primitives::Digest;
use crate::types::signature::Signature64;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Request timeout of remote signers
const REMOTE_SIGNER_TIMEOUT: Duration = Duration::from_secs(5);

/// Signs digests on behalf of one public key
pub trait SignatureProvider: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, digest: &Digest) -> Result<Signature64, SignerError>;
}

/// Signer errors
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Remote signer request failed: {0}")]
    Transport(String),

    #[error("Remote signer returned an invalid signature: {0}")]
    InvalidResponse(String),

    #[error("Signature from {0} does not verify")]
    BadSignature(PublicKey),
}

/// Signs with an in-process private key
pub struct KeySigner {
    key: PrivateKey,
    public_key: PublicKey,
}

impl KeySigner {
    pub fn new(key: PrivateKey) -> Self {
        let public_key = key.public_key();
        Self { key, public_key }
    }
}

impl SignatureProvider for KeySigner {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn sign(&self, digest: &Digest) -> Result<Signature64, SignerError> {
        Ok(self.key.sign(digest.as_bytes()))
    }
}

/// Request body sent to a remote signer: `[digest, public_key]`
#[derive(Debug, Serialize)]
struct RemoteSignRequest(String, String);

#[derive(Debug, Deserialize)]
struct RemoteSignResponse(String);

/// Delegates signing to a key daemon over HTTP
pub struct RemoteSigner {
    url: String,
    public_key: PublicKey,
    client: Client,
}

impl RemoteSigner {
    pub fn new(url: &str, public_key: PublicKey) -> Result<Self, SignerError> {
        let client = Client::builder()
            .timeout(REMOTE_SIGNER_TIMEOUT)
            .build()
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        Ok(Self {
            url: url.to_string(),
            public_key,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl SignatureProvider for RemoteSigner {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn sign(&self, digest: &Digest) -> Result<Signature64, SignerError> {
        let request = RemoteSignRequest(hex::encode(digest.as_bytes()), self.public_key.to_hex());

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SignerError::Transport(format!("HTTP {}", response.status())));
        }

        let RemoteSignResponse(encoded) = response
            .json()
            .map_err(|e| SignerError::InvalidResponse(e.to_string()))?;

        let signature = Signature64::from_hex(&encoded)
            .ok_or_else(|| SignerError::InvalidResponse(encoded.clone()))?;

        if !self.public_key.verify(digest.as_bytes(), &signature) {
            return Err(SignerError::BadSignature(self.public_key));
        }

        Ok(signature)
    }
}

/// Voter identity: every provider signs each outgoing message
#[derive(Clone)]
pub struct VoterKeys {
    providers: Vec<Arc<dyn SignatureProvider>>,
    producer: bool,
}

impl VoterKeys {
    /// Identity of a configured block producer; falls back to an ephemeral
    /// key when `providers` is empty
    pub fn new(providers: Vec<Arc<dyn SignatureProvider>>) -> Self {
        if providers.is_empty() {
            return Self::ephemeral();
        }
        Self {
            providers,
            producer: true,
        }
    }

    /// Random key for a node that observes but never votes as a producer
    pub fn ephemeral() -> Self {
        Self {
            providers: vec![Arc::new(KeySigner::new(PrivateKey::generate()))],
            producer: false,
        }
    }

    pub fn from_private_keys(keys: Vec<PrivateKey>) -> Self {
        Self::new(
            keys.into_iter()
                .map(|k| Arc::new(KeySigner::new(k)) as Arc<dyn SignatureProvider>)
                .collect(),
        )
    }

    /// True if keys were configured explicitly
    pub fn is_producer(&self) -> bool {
        self.producer
    }

    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.providers.iter().map(|p| p.public_key()).collect()
    }

    pub fn key_set(&self) -> BTreeSet<PublicKey> {
        self.public_keys().into_iter().collect()
    }

    /// Key used to identify this voter in logs and as round primary
    pub fn primary_key(&self) -> PublicKey {
        self.providers
            .first()
            .map(|p| p.public_key())
            .unwrap_or_else(|| PublicKey::from_bytes([0u8; 32]))
    }

    /// Sign `data` with every provider
    pub fn sign<T: serde::Serialize + MessageKind>(&self, data: T) -> Result<Signed<T>, SignerError> {
        let digest = signing_digest(&data);

        let signatures = self
            .providers
            .iter()
            .map(|provider| {
                Ok(KeySignature {
                    key: provider.public_key(),
                    signature: provider.sign(&digest)?,
                })
            })
            .collect::<Result<Vec<_>, SignerError>>()?;

        Ok(Signed::new(data, signatures))
    }
}

impl std::fmt::Debug for VoterKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoterKeys")
            .field("keys", &self.public_keys())
            .field("producer", &self.producer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::randpa::messages::{FinalityProofRequest, Handshake};
    use crate::types::primitives::BlockId;

    #[test]
    fn test_key_signer_signs_digest() {
        let key = PrivateKey::from_seed([4u8; 32]);
        let signer = KeySigner::new(key.clone());
        let digest = Digest::hash(b"vote");
        let sig = signer.sign(&digest).unwrap();
        assert_eq!(signer.public_key(), key.public_key());
        assert!(key.public_key().verify(digest.as_bytes(), &sig));
    }

    #[test]
    fn test_voter_keys_multisig() {
        let voter = VoterKeys::from_private_keys(vec![
            PrivateKey::from_seed([1u8; 32]),
            PrivateKey::from_seed([2u8; 32]),
        ]);
        assert!(voter.is_producer());

        let msg = voter.sign(Handshake { lib: BlockId::ZERO }).unwrap();
        assert_eq!(msg.signatures.len(), 2);
        assert!(msg.verify());
        assert_eq!(msg.public_keys().into_iter().collect::<BTreeSet<_>>(), voter.key_set());
        assert_eq!(msg.public_keys()[0], voter.primary_key());
    }

    #[test]
    fn test_empty_providers_fall_back_to_ephemeral() {
        let voter = VoterKeys::new(Vec::new());
        assert!(!voter.is_producer());
        assert_eq!(voter.public_keys().len(), 1);

        let msg = voter.sign(FinalityProofRequest { round_num: 1 }).unwrap();
        assert!(msg.verify());
    }

    #[test]
    fn test_ephemeral_keys_differ() {
        assert_ne!(
            VoterKeys::ephemeral().primary_key(),
            VoterKeys::ephemeral().primary_key()
        );
    }

    #[test]
    fn test_remote_signer_unreachable() {
        let key = PrivateKey::from_seed([1u8; 32]).public_key();
        let signer = RemoteSigner::new("http://127.0.0.1:9/sign", key).unwrap();
        assert_eq!(signer.url(), "http://127.0.0.1:9/sign");
        assert!(matches!(
            signer.sign(&Digest::hash(b"x")),
            Err(SignerError::Transport(_))
        ));
    }
}
