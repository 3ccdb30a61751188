//! # Identity Material
//!
//! Keys are opaque to the routing core: a node is constructed with a [`Keypair`]
//! and advertises its [`PublicKey`] in Connect exchanges. The core only needs two
//! things from them:
//!
//! - a stable vault id, derived as `BLAKE3(domain || public_key)`
//! - domain-separated Ed25519 signatures over Connect responses
//!
//! Clients may join with a caller-chosen id and anonymous nodes with a random
//! one, so the id binding is only enforced for vaults.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::address::NodeId;

/// Domain separation prefix for vault id derivation.
const NODE_ID_DOMAIN: &[u8] = b"meshroute-node-id-v1:";

/// Domain separation prefix for Connect response signatures.
pub const CONNECT_SIGNATURE_DOMAIN: &[u8] = b"meshroute-connect-v1:";

/// Reasons a signature can fail to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// The vault id bound to this keypair.
    pub fn node_id(&self) -> NodeId {
        self.public_key().node_id()
    }

    /// Sign `data` under `domain`; returns the 64-byte signature.
    pub fn sign_with_domain(&self, domain: &[u8], data: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        self.signing_key.sign(&prefixed).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// 32-byte Ed25519 public key carried in peer table entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn node_id(&self) -> NodeId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NODE_ID_DOMAIN);
        hasher.update(&self.0);
        NodeId::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Whether `id` is the vault id bound to this key.
    #[inline]
    pub fn binds(&self, id: &NodeId) -> bool {
        self.node_id() == *id
    }

    pub fn verify_with_domain(
        &self,
        domain: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureError::InvalidPublicKey)?;

        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);

        verifying_key
            .verify_strict(&prefixed, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypairs_are_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn node_id_is_bound_to_public_key() {
        let kp = Keypair::generate();
        let pk = kp.public_key();
        assert!(pk.binds(&kp.node_id()));
        assert!(!pk.binds(&NodeId::random()));
        assert_eq!(pk.node_id(), pk.node_id());
    }

    #[test]
    fn secret_key_round_trip_preserves_identity() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.signing_key.to_bytes());
        assert_eq!(kp.node_id(), restored.node_id());
    }

    #[test]
    fn domain_signatures_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign_with_domain(CONNECT_SIGNATURE_DOMAIN, b"exchange");
        assert_eq!(
            kp.public_key()
                .verify_with_domain(CONNECT_SIGNATURE_DOMAIN, b"exchange", &sig),
            Ok(())
        );
    }

    #[test]
    fn domain_signatures_reject_tampering() {
        let kp = Keypair::generate();
        let pk = kp.public_key();
        let sig = kp.sign_with_domain(CONNECT_SIGNATURE_DOMAIN, b"exchange");

        assert_eq!(
            pk.verify_with_domain(CONNECT_SIGNATURE_DOMAIN, b"exchangf", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            pk.verify_with_domain(b"other-domain:", b"exchange", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            pk.verify_with_domain(CONNECT_SIGNATURE_DOMAIN, b"exchange", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            pk.verify_with_domain(CONNECT_SIGNATURE_DOMAIN, b"exchange", &sig[..10]),
            Err(SignatureError::InvalidLength)
        );

        let other = Keypair::generate().public_key();
        assert_eq!(
            other.verify_with_domain(CONNECT_SIGNATURE_DOMAIN, b"exchange", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }
}
