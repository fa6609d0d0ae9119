// CLI Configuration - Gadget settings and voter identity
// Principle: Clear mapping between user input and internal configuration

use crate::consensus::randpa::{
    config, FinalitySink, ForkTree, KeySigner, NetworkSink, RandpaBuilder, RemoteSigner,
    SignatureProvider, VoterKeys,
};
use crate::types::keys::{KeyError, PrivateKey, PublicKey};
use crate::types::primitives::BlockNumber;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Finality gadget configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandpaConfig {
    /// Blocks the head may run ahead of the lib before the gadget freezes
    pub max_finality_lag_blocks: BlockNumber,
    /// Network messages older than this are dropped
    pub message_expiration_ms: u64,
    pub messages_cache_size: usize,
    pub proofs_cache_size: usize,
    /// `<public-key>=KEY:<private-key>` or `<public-key>=REMOTE:<url>`
    pub signature_providers: Vec<String>,
}

impl Default for RandpaConfig {
    fn default() -> Self {
        Self {
            max_finality_lag_blocks: config::MAX_FINALITY_LAG_BLOCKS,
            message_expiration_ms: config::MSG_EXPIRATION_MS,
            messages_cache_size: config::MESSAGES_CACHE_SIZE,
            proofs_cache_size: config::PROOFS_CACHE_SIZE,
            signature_providers: Vec::new(),
        }
    }
}

impl RandpaConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Build the voter identity from the configured signature providers
    ///
    /// Entries that fail to parse or to build a signer are logged and
    /// skipped. With no usable entry the node gets an ephemeral key and only
    /// observes.
    pub fn voter_keys(&self) -> Result<VoterKeys, ConfigError> {
        let mut providers: Vec<Arc<dyn SignatureProvider>> = Vec::new();

        for entry in &self.signature_providers {
            let spec = match SignatureProviderSpec::parse(entry) {
                Ok(spec) => spec,
                Err(e) => {
                    error!("[RANDPA] malformed signature provider '{}': {}", entry, e);
                    continue;
                }
            };
            let public_key = spec.public_key();
            match spec.into_provider() {
                Ok(provider) => providers.push(provider),
                Err(e) => {
                    error!("[RANDPA] ignoring signature provider {}: {}", public_key, e);
                    continue;
                }
            }
        }

        if providers.is_empty() {
            info!("[RANDPA] no signature provider configured, running as observer");
        }

        Ok(VoterKeys::new(providers))
    }

    /// Coordinator builder carrying these settings
    pub fn builder(
        &self,
        tree: ForkTree,
        network: Arc<dyn NetworkSink>,
        finality: Arc<dyn FinalitySink>,
    ) -> Result<RandpaBuilder, ConfigError> {
        Ok(RandpaBuilder::new(tree, network, finality)
            .voter(self.voter_keys()?)
            .max_finality_lag_blocks(self.max_finality_lag_blocks)
            .message_expiration(Duration::from_millis(self.message_expiration_ms))
            .messages_cache_size(self.messages_cache_size)
            .proofs_cache_size(self.proofs_cache_size))
    }
}

/// One parsed `signature_providers` entry
#[derive(Debug, Clone)]
pub enum SignatureProviderSpec {
    Key {
        public_key: PublicKey,
        private_key: PrivateKey,
    },
    Remote {
        public_key: PublicKey,
        url: String,
    },
}

impl SignatureProviderSpec {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedProvider(reason.to_string());

        let (public_hex, provider) = spec
            .split_once('=')
            .ok_or_else(|| malformed("expected <public-key>=<provider-type>:<data>"))?;
        let (kind, data) = provider
            .split_once(':')
            .ok_or_else(|| malformed("expected <provider-type>:<data>"))?;

        let public_key = PublicKey::from_hex(public_hex.trim()).map_err(ConfigError::InvalidKey)?;

        match kind {
            "KEY" => Ok(Self::Key {
                public_key,
                private_key: PrivateKey::from_hex(data.trim()).map_err(ConfigError::InvalidKey)?,
            }),
            "REMOTE" if !data.is_empty() => Ok(Self::Remote {
                public_key,
                url: data.to_string(),
            }),
            "REMOTE" => Err(malformed("empty remote signer url")),
            other => Err(malformed(&format!("unsupported provider type '{}'", other))),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Key { public_key, .. } | Self::Remote { public_key, .. } => *public_key,
        }
    }

    pub fn into_provider(self) -> Result<Arc<dyn SignatureProvider>, ConfigError> {
        match self {
            Self::Key {
                public_key,
                private_key,
            } => {
                if private_key.public_key() != public_key {
                    return Err(ConfigError::KeyMismatch(public_key));
                }
                Ok(Arc::new(KeySigner::new(private_key)))
            }
            Self::Remote { public_key, url } => {
                let signer = RemoteSigner::new(&url, public_key)
                    .map_err(|e| ConfigError::SignerError(e.to_string()))?;
                Ok(Arc::new(signer))
            }
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Malformed signature provider: {0}")]
    MalformedProvider(String),

    #[error("Invalid key: {0}")]
    InvalidKey(KeyError),

    #[error("Private key does not match public key {0}")]
    KeyMismatch(PublicKey),

    #[error("Signer error: {0}")]
    SignerError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key_spec(seed: u8) -> (PublicKey, String) {
        let private = PrivateKey::from_seed([seed; 32]);
        let public = private.public_key();
        (public, format!("{}=KEY:{}", public.to_hex(), hex::encode([seed; 32])))
    }

    #[test]
    fn test_default_config() {
        let config = RandpaConfig::default();
        assert_eq!(config.max_finality_lag_blocks, 69 * 12 * 2 * 2);
        assert_eq!(config.message_expiration_ms, 1000);
        assert_eq!(config.proofs_cache_size, 2);
        assert!(config.signature_providers.is_empty());
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_finality_lag_blocks": 10, "proofs_cache_size": 5 }}"#).unwrap();

        let config = RandpaConfig::load(file.path()).unwrap();
        assert_eq!(config.max_finality_lag_blocks, 10);
        assert_eq!(config.proofs_cache_size, 5);
        assert_eq!(config.messages_cache_size, config::MESSAGES_CACHE_SIZE);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("randpa.json");
        assert!(matches!(RandpaConfig::load(&missing), Err(ConfigError::NotFound(_))));

        std::fs::write(&missing, "not json").unwrap();
        assert!(matches!(RandpaConfig::load(&missing), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_parse_key_provider() {
        let (public, spec) = key_spec(7);
        let parsed = SignatureProviderSpec::parse(&spec).unwrap();
        assert!(matches!(parsed, SignatureProviderSpec::Key { .. }));
        assert_eq!(parsed.public_key(), public);
    }

    #[test]
    fn test_parse_remote_provider() {
        let public = PrivateKey::from_seed([1u8; 32]).public_key();
        let spec = format!("{}=REMOTE:http://127.0.0.1:8900/v1/wallet/sign_digest", public.to_hex());
        match SignatureProviderSpec::parse(&spec).unwrap() {
            SignatureProviderSpec::Remote { public_key, url } => {
                assert_eq!(public_key, public);
                assert_eq!(url, "http://127.0.0.1:8900/v1/wallet/sign_digest");
            }
            other => panic!("Expected remote provider, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_malformed_providers() {
        let public = PrivateKey::from_seed([1u8; 32]).public_key().to_hex();
        for spec in [
            "garbage".to_string(),
            format!("{}=KEY", public),
            format!("{}=KEOSD:http://localhost", public),
            format!("{}=REMOTE:", public),
            "zz=KEY:00".to_string(),
        ] {
            assert!(SignatureProviderSpec::parse(&spec).is_err(), "accepted {}", spec);
        }
    }

    #[test]
    fn test_voter_keys_skip_malformed() {
        let (public, spec) = key_spec(3);
        let config = RandpaConfig {
            signature_providers: vec!["nonsense".to_string(), spec],
            ..Default::default()
        };

        let voter = config.voter_keys().unwrap();
        assert!(voter.is_producer());
        assert_eq!(voter.public_keys(), vec![public]);
    }

    #[test]
    fn test_voter_keys_multisig() {
        let (first, first_spec) = key_spec(3);
        let (second, second_spec) = key_spec(4);
        let config = RandpaConfig {
            signature_providers: vec![first_spec, second_spec],
            ..Default::default()
        };

        let voter = config.voter_keys().unwrap();
        assert_eq!(voter.public_keys(), vec![first, second]);
    }

    #[test]
    fn test_voter_keys_without_providers() {
        let voter = RandpaConfig::default().voter_keys().unwrap();
        assert!(!voter.is_producer());
    }

    #[test]
    fn test_key_mismatch_is_skipped() {
        let mismatched = PrivateKey::from_seed([9u8; 32]).public_key();
        let (public, spec) = key_spec(4);
        let config = RandpaConfig {
            signature_providers: vec![
                format!("{}=KEY:{}", mismatched.to_hex(), hex::encode([3u8; 32])),
                spec,
            ],
            ..Default::default()
        };

        let voter = config.voter_keys().unwrap();
        assert!(voter.is_producer());
        assert_eq!(voter.public_keys(), vec![public]);
    }

    #[test]
    fn test_only_bad_providers_leave_observer() {
        let mismatched = PrivateKey::from_seed([9u8; 32]).public_key();
        let config = RandpaConfig {
            signature_providers: vec![
                format!("{}=KEY:{}", mismatched.to_hex(), hex::encode([3u8; 32])),
                "nonsense".to_string(),
            ],
            ..Default::default()
        };

        let voter = config.voter_keys().unwrap();
        assert!(!voter.is_producer());
        assert!(!voter.public_keys().contains(&mismatched));
    }
}
