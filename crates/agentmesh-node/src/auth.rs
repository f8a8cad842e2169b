//! Message authentication.
//!
//! Application messages are signed with the sender's Ed25519 key over
//! `AppMessage::signing_bytes()`. A receiver derives the sender's peer id
//! from the embedded public key and requires it to match both the claimed
//! `from` field and the peer the message actually arrived from.

use std::num::NonZeroUsize;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use lru::LruCache;
use thiserror::Error;

use agentmesh_protocol::AppMessage;

/// Verified public keys remembered per bridge.
pub const DEFAULT_KEY_CACHE_SIZE: usize = 1_024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("message is not signed")]
    Unsigned,
    #[error("malformed public key")]
    BadPublicKey,
    #[error("malformed signature")]
    BadSignature,
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("key belongs to {derived}, message claims {claimed}")]
    SenderMismatch { derived: String, claimed: String },
    #[error("key belongs to {derived}, message arrived from {transport}")]
    TransportMismatch { derived: String, transport: String },
}

/// Derive the base58 libp2p peer id owned by a raw Ed25519 public key.
pub fn peer_id_from_public_key(public_key: &[u8]) -> Result<String, AuthError> {
    let ed = libp2p::identity::ed25519::PublicKey::try_from_bytes(public_key)
        .map_err(|_| AuthError::BadPublicKey)?;
    Ok(libp2p::identity::PublicKey::from(ed).to_peer_id().to_base58())
}

fn verifying_key(public_key: &[u8]) -> Result<VerifyingKey, AuthError> {
    let arr: [u8; 32] = public_key.try_into().map_err(|_| AuthError::BadPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| AuthError::BadPublicKey)
}

/// Verify a detached signature and return the signer's peer id.
pub fn verify_detached(
    public_key: &[u8],
    message:    &[u8],
    signature:  &[u8],
) -> Result<String, AuthError> {
    let vk  = verifying_key(public_key)?;
    let sig = Signature::from_slice(signature).map_err(|_| AuthError::BadSignature)?;
    vk.verify(message, &sig).map_err(|_| AuthError::InvalidSignature)?;
    peer_id_from_public_key(public_key)
}

// ============================================================================
// MessageAuth
// ============================================================================

/// Signs outbound messages and verifies inbound ones.
///
/// Owns a bounded LRU of verified keys (hex-encoded key → peer id) so the
/// peer-id derivation runs once per key.
pub struct MessageAuth {
    signing_key: SigningKey,
    public_key:  [u8; 32],
    key_cache:   LruCache<String, (VerifyingKey, String)>,
}

impl MessageAuth {
    pub fn new(signing_key: SigningKey, cache_size: usize) -> Self {
        let public_key = signing_key.verifying_key().to_bytes();
        let cap = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { signing_key, public_key, key_cache: LruCache::new(cap) }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn sign_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing_key.sign(bytes).to_bytes().to_vec()
    }

    /// Attach signature and public key to an outbound message.
    pub fn sign(&self, msg: &mut AppMessage) {
        msg.signature  = Some(self.sign_bytes(&msg.signing_bytes()));
        msg.public_key = Some(self.public_key.to_vec());
    }

    pub fn verify(&mut self, msg: &AppMessage, transport_peer: &str) -> Result<(), AuthError> {
        let (Some(sig), Some(pk)) = (&msg.signature, &msg.public_key) else {
            return Err(AuthError::Unsigned);
        };

        let cache_key = hex::encode(pk);
        let (vk, derived) = match self.key_cache.get(&cache_key) {
            Some(entry) => entry.clone(),
            None => {
                let vk      = verifying_key(pk)?;
                let derived = peer_id_from_public_key(pk)?;
                self.key_cache.put(cache_key, (vk, derived.clone()));
                (vk, derived)
            }
        };

        let sig = Signature::from_slice(sig).map_err(|_| AuthError::BadSignature)?;
        vk.verify(&msg.signing_bytes(), &sig)
            .map_err(|_| AuthError::InvalidSignature)?;

        if derived != msg.from {
            return Err(AuthError::SenderMismatch { derived, claimed: msg.from.clone() });
        }
        if derived != transport_peer {
            return Err(AuthError::TransportMismatch {
                derived,
                transport: transport_peer.to_owned(),
            });
        }
        Ok(())
    }

    pub fn cached_keys(&self) -> usize {
        self.key_cache.len()
    }
}
