//! Pairwise key agreement.
//!
//! Each side converts its Ed25519 identity into X25519 form and computes
//!
//!   DH = X25519(IK_self, IK_peer)
//!   SK = HKDF(salt="pc-shared-v1", ikm=DH, info=conversation_id)
//!
//! Both participants derive the same `SK` because DH is symmetric and the
//! conversation ID is order-independent. `SK` keys the envelope AEAD.

pub use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::CryptoError, kdf};

/// 32-byte symmetric key shared with one peer. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Convert an Ed25519 signing key (32 bytes) to an X25519 static secret.
/// This uses the clamped SHA-512 expansion that ed25519-dalek uses internally.
pub fn ed25519_secret_to_x25519(ed_secret: &[u8; 32]) -> StaticSecret {
    use sha2::{Digest, Sha512};
    let mut h = Sha512::digest(ed_secret);
    // Clamp as per RFC 7748 §5
    h[0] &= 248;
    h[31] &= 127;
    h[31] |= 64;
    let mut key = [0u8; 32];
    key.copy_from_slice(&h[..32]);
    h.as_mut_slice().zeroize();
    StaticSecret::from(key)
}

/// Convert an Ed25519 verifying key (public, 32 bytes) to an X25519 public key.
/// Uses the birational map from the Ed25519 curve to Curve25519.
pub fn ed25519_pub_to_x25519(ed_pub: &[u8; 32]) -> Result<X25519Public, CryptoError> {
    use curve25519_dalek::edwards::CompressedEdwardsY;
    let compressed = CompressedEdwardsY::from_slice(ed_pub)
        .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
    })?;
    Ok(X25519Public::from(point.to_montgomery().to_bytes()))
}

/// Derive the pairwise key for `conversation_id`.
pub fn derive_shared_key(
    my_secret: &StaticSecret,
    peer_public: &X25519Public,
    conversation_id: &str,
) -> Result<SharedKey, CryptoError> {
    let dh = my_secret.diffie_hellman(peer_public);
    if !dh.was_contributory() {
        return Err(CryptoError::WeakAgreement);
    }
    let mut key = [0u8; 32];
    kdf::hkdf_expand(
        dh.as_bytes(),
        Some(b"pc-shared-v1"),
        conversation_id.as_bytes(),
        &mut key,
    )?;
    Ok(SharedKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;

    #[test]
    fn both_sides_derive_the_same_key() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();

        let k_ab = derive_shared_key(
            &alice.x25519_secret(),
            &bob.x25519_public().unwrap(),
            "conv-1",
        )
        .unwrap();
        let k_ba = derive_shared_key(
            &bob.x25519_secret(),
            &alice.x25519_public().unwrap(),
            "conv-1",
        )
        .unwrap();
        assert_eq!(k_ab.as_bytes(), k_ba.as_bytes());
    }

    #[test]
    fn converted_secret_matches_converted_public() {
        let id = IdentityKeyPair::generate();
        let from_secret = X25519Public::from(&id.x25519_secret());
        assert_eq!(from_secret, id.x25519_public().unwrap());
    }

    #[test]
    fn conversation_binds_the_key() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let peer = bob.x25519_public().unwrap();
        let k1 = derive_shared_key(&alice.x25519_secret(), &peer, "conv-1").unwrap();
        let k2 = derive_shared_key(&alice.x25519_secret(), &peer, "conv-2").unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn low_order_point_is_rejected() {
        let alice = IdentityKeyPair::generate();
        let zero = X25519Public::from([0u8; 32]);
        assert!(matches!(
            derive_shared_key(&alice.x25519_secret(), &zero, "c"),
            Err(CryptoError::WeakAgreement)
        ));
    }
}
