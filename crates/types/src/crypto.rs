//! Ed25519 keys and signatures.
//!
//! Consensus treats signing as an opaque service: the state machine signs its
//! own messages with a [`KeyPair`] and delegates verification of everything
//! it receives to the runner, which calls [`PublicKey::verify`] on a worker
//! pool.

use crate::NodeId;
use ed25519_dalek::{Signer, Verifier};
use sbor::prelude::BasicSbor;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

/// A signing key pair. Cheap to clone.
#[derive(Clone)]
pub struct KeyPair {
    inner: Arc<ed25519_dalek::Keypair>,
}

impl KeyPair {
    /// Derive a key pair from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self, CryptoError> {
        let secret = ed25519_dalek::SecretKey::from_bytes(seed)
            .map_err(|e| CryptoError::InvalidSecretKey(e.to_string()))?;
        let public: ed25519_dalek::PublicKey = (&secret).into();
        Ok(Self {
            inner: Arc::new(ed25519_dalek::Keypair { secret, public }),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.inner.public.to_bytes())
    }

    /// The node identity corresponding to this key.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.inner.public.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.inner.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// An ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Verify `signature` over `message`. Malformed keys or signatures verify as false.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = ed25519_dalek::PublicKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::try_from(signature.0.as_slice()) else {
            return false;
        };
        key.verify(message, &sig).is_ok()
    }
}

impl From<NodeId> for PublicKey {
    fn from(id: NodeId) -> Self {
        PublicKey(id.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &hex::encode(self.0)[..12])
    }
}

/// A detached signature.
#[derive(Clone, PartialEq, Eq, Hash, BasicSbor)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// An empty placeholder; never verifies.
    pub fn empty() -> Self {
        Signature(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = self.0.len().min(6);
        write!(f, "Signature({}..)", hex::encode(&self.0[..shown]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::from_seed(&[7u8; 32]).unwrap();
        let sig = key.sign(b"prepare");
        assert!(key.public_key().verify(b"prepare", &sig));
        assert!(!key.public_key().verify(b"commit", &sig));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = KeyPair::from_seed(&[1u8; 32]).unwrap();
        let b = KeyPair::from_seed(&[2u8; 32]).unwrap();
        let sig = a.sign(b"msg");
        assert!(!b.public_key().verify(b"msg", &sig));
    }

    #[test]
    fn test_empty_signature_never_verifies() {
        let key = KeyPair::from_seed(&[3u8; 32]).unwrap();
        assert!(!key.public_key().verify(b"msg", &Signature::empty()));
    }

    #[test]
    fn test_node_id_matches_public_key() {
        let key = KeyPair::from_seed(&[4u8; 32]).unwrap();
        assert_eq!(PublicKey::from(key.node_id()), key.public_key());
    }
}
