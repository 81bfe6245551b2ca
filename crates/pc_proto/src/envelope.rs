//! Plaintext bodies carried inside sealed payloads, and the notification
//! the relay forwards.
//!
//! The relay is a DUMB FORWARDER: it only sees
//!   - type       (needed for push routing / collapse keys)
//!   - sender_id  (needed to address the reply)
//!   - payload    (opaque base64url ciphertext)
//!   - checksum   (integrity checksum of the plaintext body)
//!
//! The relay CANNOT see: content, message IDs, receipt targets, typing state.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pc_crypto::{agreement, identity::IdentityKeyPair, CryptoError, SessionId};

use crate::message::AckKind;

/// Current envelope encryption version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Current time truncated to millisecond precision, matching the wire encoding
/// so that bodies compare equal after a round trip.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Notification `type` values recognised by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Message,
    DeliveryReceipt,
    ReadReceipt,
    TypingIndicator,
    PresenceUpdate,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::Message => "message",
            NotificationType::DeliveryReceipt => "delivery_receipt",
            NotificationType::ReadReceipt => "read_receipt",
            NotificationType::TypingIndicator => "typing_indicator",
            NotificationType::PresenceUpdate => "presence_update",
        }
    }

    /// Ephemeral signals are never persisted and never retried.
    pub fn is_ephemeral(self) -> bool {
        matches!(
            self,
            NotificationType::TypingIndicator | NotificationType::PresenceUpdate
        )
    }

    pub fn for_ack(kind: AckKind) -> Self {
        match kind {
            AckKind::Delivered => NotificationType::DeliveryReceipt,
            AckKind::Read => NotificationType::ReadReceipt,
        }
    }
}

/// What the relay forwards between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub sender_id: String,
    /// base64url(nonce || ciphertext+tag)
    pub payload: String,
    pub checksum: String,
}

/// Plaintext message envelope (before encryption).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: String,
    pub sender_id: String,
    pub conversation_id: String,
    pub message: String,
    pub sender_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Delivery or read receipt.
///
/// Receipts are signed by the sender's Ed25519 identity. The signer key
/// must map (Ed25519 → X25519) onto the key embedded in `sender_id`, so a
/// party holding only the pairwise AEAD key cannot mint receipts in the
/// other participant's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub kind: AckKind,
    pub message_ids: Vec<String>,
    pub sender_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// base64url Ed25519 verifying key
    pub signer: String,
    /// base64url Ed25519 signature over `canonical_bytes`
    pub signature: String,
}

impl Receipt {
    pub fn signed(
        kind: AckKind,
        message_ids: Vec<String>,
        sender_id: &SessionId,
        identity: &IdentityKeyPair,
    ) -> Self {
        let timestamp = now_millis();
        let canonical = canonical_receipt_bytes(kind, &message_ids, sender_id.as_str(), timestamp);
        Self {
            kind,
            message_ids,
            sender_id: sender_id.to_string(),
            timestamp,
            signer: URL_SAFE_NO_PAD.encode(identity.public_bytes()),
            signature: URL_SAFE_NO_PAD.encode(identity.sign(&canonical)),
        }
    }

    /// Check that the receipt was signed by the identity behind `sender_id`.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let sender = SessionId::parse(&self.sender_id)?;
        let signer: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&self.signer)?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("receipt signer must be 32 bytes".into()))?;
        if agreement::ed25519_pub_to_x25519(&signer)? != sender.x25519_public()? {
            return Err(CryptoError::SignatureVerification);
        }
        let sig = URL_SAFE_NO_PAD.decode(&self.signature)?;
        let canonical =
            canonical_receipt_bytes(self.kind, &self.message_ids, &self.sender_id, self.timestamp);
        IdentityKeyPair::verify(&signer, &canonical, &sig)
    }
}

fn canonical_receipt_bytes(
    kind: AckKind,
    message_ids: &[String],
    sender_id: &str,
    timestamp: DateTime<Utc>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + message_ids.len() * 17);
    out.extend_from_slice(b"pc-receipt-v1\x00");
    out.extend_from_slice(kind.as_str().as_bytes());
    out.push(0);
    out.extend_from_slice(sender_id.as_bytes());
    out.push(0);
    out.extend_from_slice(&timestamp.timestamp_millis().to_le_bytes());
    for id in message_ids {
        out.push(0);
        out.extend_from_slice(id.as_bytes());
    }
    out
}

/// Ephemeral typing signal; never persisted, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    pub sender_id: String,
    pub is_typing: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Presence broadcast; advisory, UI only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSignal {
    pub sender_id: String,
    pub online: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}
