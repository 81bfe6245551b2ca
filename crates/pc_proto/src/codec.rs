//! Wire codec: checksummed framing and padding for sealed bodies.
//!
//! Outbound: `body → JSON → checksum(JSON) → pad → (AEAD, done by the key store)`.
//! Inbound:  `(AEAD open) → unpad → verify checksum → JSON → body`.
//!
//! # Padding
//! To resist traffic analysis, plaintext is padded to fixed size buckets
//! INSIDE the AEAD, so the relay sees uniform-sized ciphertext.
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384
//! Larger bodies are not padded.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use pc_crypto::hash;

/// Padding mode for metadata minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// No padding; minimal bandwidth.
    None,
    /// Pad to fixed-size buckets.
    #[default]
    Buckets,
    /// Pad everything to the largest bucket.
    Maximum,
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384];
const MAX_BUCKET: usize = 16384;

/// Pad plaintext to the next bucket boundary.
///
/// Format: [original_len: u32 LE] [plaintext] [random padding]
pub fn pad_to_bucket(plaintext: &[u8], mode: PaddingMode) -> Vec<u8> {
    let needed = 4 + plaintext.len();
    let target = match mode {
        PaddingMode::None => needed,
        PaddingMode::Buckets => BUCKET_SIZES
            .iter()
            .copied()
            .find(|&b| b >= needed)
            .unwrap_or(needed),
        PaddingMode::Maximum => needed.max(MAX_BUCKET),
    };
    pad_to_size(plaintext, target)
}

/// Remove padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<&[u8], CodecError> {
    if padded.len() < 4 {
        return Err(CodecError::InvalidPadding("too short for length prefix".into()));
    }
    let len = u32::from_le_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if 4 + len > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "length prefix {len} exceeds padded data size {}",
            padded.len()
        )));
    }
    Ok(&padded[4..4 + len])
}

fn pad_to_size(plaintext: &[u8], target: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(plaintext);
    // Random fill, not zeros; avoids compression leaks
    let remaining = target.saturating_sub(out.len());
    if remaining > 0 {
        let mut padding = vec![0u8; remaining];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut padding);
        out.extend_from_slice(&padding);
    }
    out
}

/// A body ready for sealing.
pub struct Framed {
    /// Length-prefixed, padded JSON.
    pub padded: Vec<u8>,
    /// Checksum over the unpadded JSON.
    pub checksum: String,
}

/// Serialise, checksum and pad a body.
pub fn frame<T: Serialize>(body: &T, mode: PaddingMode) -> Result<Framed, CodecError> {
    let json = serde_json::to_vec(body).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let checksum = hash::checksum(&json);
    Ok(Framed { padded: pad_to_bucket(&json, mode), checksum })
}

/// Unpad, verify the checksum and parse a body.
pub fn unframe<T: DeserializeOwned>(padded: &[u8], checksum: &str) -> Result<T, CodecError> {
    let json = unpad(padded)?;
    if !hash::checksum_matches(json, checksum) {
        return Err(CodecError::ChecksumMismatch);
    }
    serde_json::from_slice(json).map_err(|e| CodecError::Serialization(e.to_string()))
}

pub fn encode_payload(sealed: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(sealed)
}

pub fn decode_payload(payload: &str) -> Result<Vec<u8>, CodecError> {
    URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
    #[error("Invalid payload encoding: {0}")]
    InvalidPayload(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TypingSignal;

    #[test]
    fn pad_unpad_roundtrip_buckets() {
        let msg = b"Hello, World!";
        let padded = pad_to_bucket(msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn pad_none_only_prefixes_length() {
        let msg = b"No padding test";
        let padded = pad_to_bucket(msg, PaddingMode::None);
        assert_eq!(padded.len(), 4 + msg.len());
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn pad_large_message_picks_next_bucket() {
        let msg = vec![0x42u8; 5000];
        let padded = pad_to_bucket(&msg, PaddingMode::Buckets);
        assert_eq!(padded.len(), 16384);
        assert_eq!(unpad(&padded).unwrap(), msg.as_slice());
    }

    #[test]
    fn pad_maximum() {
        let padded = pad_to_bucket(b"tiny", PaddingMode::Maximum);
        assert_eq!(padded.len(), MAX_BUCKET);
    }

    #[test]
    fn bogus_length_prefix_is_rejected() {
        let mut padded = pad_to_bucket(b"abc", PaddingMode::None);
        padded[0] = 0xFF;
        assert!(matches!(unpad(&padded), Err(CodecError::InvalidPadding(_))));
    }

    #[test]
    fn frame_then_unframe() {
        let body = TypingSignal {
            sender_id: "05aa".into(),
            is_typing: true,
            timestamp: chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        };
        let framed = frame(&body, PaddingMode::Buckets).unwrap();
        let back: TypingSignal = unframe(&framed.padded, &framed.checksum).unwrap();
        assert_eq!(back, body);
    }

    #[test]
    fn wrong_checksum_is_detected() {
        let framed = frame(&"hello", PaddingMode::None).unwrap();
        let other = frame(&"hellO", PaddingMode::None).unwrap();
        let res: Result<String, _> = unframe(&framed.padded, &other.checksum);
        assert!(matches!(res, Err(CodecError::ChecksumMismatch)));
    }
}
