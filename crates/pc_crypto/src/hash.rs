//! BLAKE3-based hash utilities
//!
//! - Integrity checksums over plaintext envelopes
//! - Deterministic conversation IDs derived from two session IDs
//! - Short message IDs

/// Integrity checksum of a plaintext envelope, hex-encoded.
pub fn checksum(plaintext: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"pc-checksum-v1\x00");
    hasher.update(plaintext);
    hex::encode(hasher.finalize().as_bytes())
}

/// Compare `plaintext` against a hex checksum in constant time.
///
/// Malformed hex never matches.
pub fn checksum_matches(plaintext: &[u8], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let Ok(expected): Result<[u8; 32], _> = expected.try_into() else {
        return false;
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"pc-checksum-v1\x00");
    hasher.update(plaintext);
    // blake3::Hash equality is constant-time
    hasher.finalize() == blake3::Hash::from(expected)
}

/// Conversation ID shared by both participants.
///
/// Order-independent: `conversation_id(a, b) == conversation_id(b, a)`.
pub fn conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"pc-conversation-v1\x00");
    hasher.update(lo.as_bytes());
    hasher.update(b"\x00");
    hasher.update(hi.as_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// Generate a short random message ID (16 hex chars).
pub fn short_message_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
