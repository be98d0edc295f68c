//! # Secret Material
//!
//! The identity material an enforcer signs its tokens with. Two closed
//! variants exist: a pre-shared key and a PKI bundle. Secret material is
//! immutable after creation; only the PKI peer-key registry mutates, and
//! those mutations are serialized behind a lock.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Closed set of secret variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretsType {
    Psk,
    Pki,
}

/// Identity material shared immutably across enforcer instances for a
/// given server identity.
pub trait Secrets: Send + Sync {
    /// Which variant this is.
    fn secrets_type(&self) -> SecretsType;

    /// Trust-anchor material used to verify peers.
    fn auth_pem(&self) -> Vec<u8>;

    /// Material transmitted on the wire during the handshake.
    fn transmitted_pem(&self) -> Vec<u8>;

    /// Material used to sign outgoing tokens.
    fn encoding_pem(&self) -> Vec<u8>;

    /// Expected size of ack packets carrying a token of this type.
    fn ack_size(&self) -> u32;
}

/// Extension for secrets that accept peer public keys at runtime.
pub trait PublicKeyAdder: Send + Sync {
    /// Register the public key of a known peer host.
    fn add_public_key(&self, host: &str, pem: Vec<u8>);
}

/// Pre-shared-key secrets. The key doubles as every PEM surface.
#[derive(Debug, Clone)]
pub struct PskSecrets {
    shared_key: Vec<u8>,
}

impl PskSecrets {
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            shared_key: key.into(),
        }
    }
}

impl Secrets for PskSecrets {
    fn secrets_type(&self) -> SecretsType {
        SecretsType::Psk
    }

    fn auth_pem(&self) -> Vec<u8> {
        self.shared_key.clone()
    }

    fn transmitted_pem(&self) -> Vec<u8> {
        self.shared_key.clone()
    }

    fn encoding_pem(&self) -> Vec<u8> {
        self.shared_key.clone()
    }

    fn ack_size(&self) -> u32 {
        332
    }
}

/// PKI secrets: a private key, the matching certificate, the CA bundle
/// and an optional registry of pre-distributed peer public keys. When a
/// peer's key is already registered, certificates are not transmitted on
/// the wire.
pub struct PkiSecrets {
    private_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    ca_pem: Vec<u8>,
    known_keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl PkiSecrets {
    #[must_use]
    pub fn new(private_pem: Vec<u8>, cert_pem: Vec<u8>, ca_pem: Vec<u8>) -> Self {
        Self {
            private_pem,
            cert_pem,
            ca_pem,
            known_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a registered peer key.
    #[must_use]
    pub fn public_key_of(&self, host: &str) -> Option<Vec<u8>> {
        self.known_keys.read().get(host).cloned()
    }
}

impl Secrets for PkiSecrets {
    fn secrets_type(&self) -> SecretsType {
        SecretsType::Pki
    }

    fn auth_pem(&self) -> Vec<u8> {
        self.ca_pem.clone()
    }

    fn transmitted_pem(&self) -> Vec<u8> {
        self.cert_pem.clone()
    }

    fn encoding_pem(&self) -> Vec<u8> {
        self.private_pem.clone()
    }

    fn ack_size(&self) -> u32 {
        322
    }
}

impl PublicKeyAdder for PkiSecrets {
    fn add_public_key(&self, host: &str, pem: Vec<u8>) {
        self.known_keys.write().insert(host.to_string(), pem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psk_surfaces_are_the_key() {
        let secrets = PskSecrets::new(b"sharedkey".to_vec());
        assert_eq!(secrets.secrets_type(), SecretsType::Psk);
        assert_eq!(secrets.auth_pem(), b"sharedkey");
        assert_eq!(secrets.transmitted_pem(), b"sharedkey");
        assert_eq!(secrets.encoding_pem(), b"sharedkey");
    }

    #[test]
    fn test_pki_key_registry() {
        let secrets = PkiSecrets::new(b"priv".to_vec(), b"cert".to_vec(), b"ca".to_vec());
        assert!(secrets.public_key_of("peer1").is_none());
        secrets.add_public_key("peer1", b"peerkey".to_vec());
        assert_eq!(secrets.public_key_of("peer1").unwrap(), b"peerkey");
    }
}
