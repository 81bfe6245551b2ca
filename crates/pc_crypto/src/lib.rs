//! pc_crypto: cryptographic primitives for the peer chat client
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`  : long-term Ed25519 identity, session identifiers, fingerprints
//! - `agreement` : X25519 key agreement and Ed25519 → X25519 conversion
//! - `aead`      : XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`       : HKDF / Argon2id key derivation
//! - `hash`      : BLAKE3 utilities (checksums, conversation IDs)
//! - `error`     : unified error type

pub mod aead;
pub mod agreement;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;

pub use agreement::{SharedKey, X25519Public};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, SessionId};
