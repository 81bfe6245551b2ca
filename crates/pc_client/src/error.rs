use thiserror::Error;

use pc_crypto::CryptoError;
use pc_proto::CodecError;
use pc_store::StoreError;

/// Coarse error classes surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    KeyUnavailable,
    DecryptionFailed,
    ChecksumMismatch,
    TransportRejected,
    TransportTimeout,
    Unknown,
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("No key known for peer {0}")]
    NotFound(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Key agreement failed: {0}")]
    Agreement(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Key unavailable for {0}")]
    KeyUnavailable(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Transport rejected: {0}")]
    TransportRejected(String),

    #[error("Transport timed out")]
    TransportTimeout,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Unknown(String),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::KeyUnavailable(_) => ErrorKind::KeyUnavailable,
            ChatError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            ChatError::ChecksumMismatch => ErrorKind::ChecksumMismatch,
            ChatError::TransportRejected(_) => ErrorKind::TransportRejected,
            ChatError::TransportTimeout => ErrorKind::TransportTimeout,
            ChatError::Store(_) | ChatError::Config(_) | ChatError::NotFound(_) | ChatError::Unknown(_) => {
                ErrorKind::Unknown
            }
        }
    }
}

impl From<KeyError> for ChatError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::NotFound(peer) => ChatError::KeyUnavailable(peer),
            other => ChatError::KeyUnavailable(other.to_string()),
        }
    }
}

impl From<CodecError> for ChatError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::ChecksumMismatch => ChatError::ChecksumMismatch,
            other => ChatError::DecryptionFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_map_to_distinct_kinds() {
        assert_eq!(ChatError::from(CodecError::ChecksumMismatch).kind(), ErrorKind::ChecksumMismatch);
        assert_eq!(
            ChatError::from(CodecError::InvalidPadding("x".into())).kind(),
            ErrorKind::DecryptionFailed
        );
    }

    #[test]
    fn missing_key_is_key_unavailable() {
        let e: ChatError = KeyError::NotFound("05ab".into()).into();
        assert_eq!(e.kind(), ErrorKind::KeyUnavailable);
    }
}
