//! Identity key management
//!
//! Each local user has one long-term `IdentityKeyPair` (Ed25519). Its
//! X25519 form participates in pairwise key agreement (see `agreement`).
//!
//! Session identifiers
//! -------------------
//! A `SessionId` is the public address peers exchange (QR code / copy-paste):
//!
//!   "05" || hex(X25519 public key)  (66 hex characters)
//!
//! The prefix byte marks the key type so a future key scheme can coexist.
//! Because the X25519 key is embedded, registering a contact only needs
//! the session ID itself.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::{agreement, error::CryptoError};

const SESSION_ID_PREFIX: &str = "05";

// ── Session ID ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn from_x25519(public: &X25519Public) -> Self {
        Self(format!("{SESSION_ID_PREFIX}{}", hex::encode(public.as_bytes())))
    }

    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let s = s.trim().to_ascii_lowercase();
        let Some(key_hex) = s.strip_prefix(SESSION_ID_PREFIX) else {
            return Err(CryptoError::InvalidSessionId(format!(
                "missing '{SESSION_ID_PREFIX}' prefix"
            )));
        };
        if key_hex.len() != 64 {
            return Err(CryptoError::InvalidSessionId(format!(
                "expected 66 characters, got {}",
                s.len()
            )));
        }
        hex::decode(key_hex)?;
        Ok(Self(s))
    }

    /// X25519 public key embedded in the session ID.
    pub fn x25519_public(&self) -> Result<X25519Public, CryptoError> {
        let bytes = hex::decode(&self.0[SESSION_ID_PREFIX.len()..])?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Expected 32-byte X25519 key".into()))?;
        Ok(X25519Public::from(arr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4 for display.
    ///
    /// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.0.as_bytes());
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term identity signing key.  Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { secret_bytes: signing_key.to_bytes() }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("Identity key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self { secret_bytes })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_bytes)
    }

    /// Raw Ed25519 verifying key.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key().verifying_key().to_bytes()
    }

    /// Sign arbitrary bytes; returns 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key().sign(msg).to_bytes().to_vec()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(
            public_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?,
        )
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes.try_into().map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
        );
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }

    /// X25519 form of the identity secret, for key agreement.
    pub fn x25519_secret(&self) -> StaticSecret {
        agreement::ed25519_secret_to_x25519(&self.secret_bytes)
    }

    /// X25519 form of the identity public key.
    pub fn x25519_public(&self) -> Result<X25519Public, CryptoError> {
        agreement::ed25519_pub_to_x25519(&self.public_bytes())
    }

    pub fn session_id(&self) -> Result<SessionId, CryptoError> {
        Ok(SessionId::from_x25519(&self.x25519_public()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_roundtrips_through_parse() {
        let id = IdentityKeyPair::generate();
        let sid = id.session_id().unwrap();
        assert_eq!(sid.as_str().len(), 66);
        assert!(sid.as_str().starts_with("05"));
        let parsed = SessionId::parse(&sid.as_str().to_uppercase()).unwrap();
        assert_eq!(parsed, sid);
        assert_eq!(parsed.x25519_public().unwrap(), id.x25519_public().unwrap());
    }

    #[test]
    fn malformed_session_ids_are_rejected() {
        assert!(SessionId::parse("06abcd").is_err());
        assert!(SessionId::parse("05abcd").is_err());
        assert!(SessionId::parse(&format!("05{}", "zz".repeat(32))).is_err());
    }

    #[test]
    fn sign_and_verify() {
        let id = IdentityKeyPair::generate();
        let sig = id.sign(b"receipt");
        assert!(IdentityKeyPair::verify(&id.public_bytes(), b"receipt", &sig).is_ok());
        assert!(IdentityKeyPair::verify(&id.public_bytes(), b"forged", &sig).is_err());
    }

    #[test]
    fn restore_from_secret_bytes() {
        let id = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_bytes(id.secret_bytes()).unwrap();
        assert_eq!(restored.session_id().unwrap(), id.session_id().unwrap());
        assert!(IdentityKeyPair::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn fingerprint_is_grouped() {
        let sid = IdentityKeyPair::generate().session_id().unwrap();
        let fp = sid.fingerprint();
        assert_eq!(fp.split(' ').count(), 10);
    }
}
