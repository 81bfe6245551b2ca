//! Stored records. Serialised camelCase, one JSON object per record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pc_proto::{merge_status, MessageStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Sender copy: when the delivery receipt arrived. Receiver copy: when decrypted.
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Sender copy: when the read receipt arrived. Receiver copy: when the user consumed it.
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub encryption_version: u8,
    /// True on the sender's own copy.
    #[serde(default)]
    pub is_outgoing: bool,
    #[serde(default)]
    pub is_deleted: bool,
    /// Receiver copy only: the transport accepted our delivery receipt.
    #[serde(default)]
    pub delivery_ack_sent: bool,
    /// Receiver copy only: the transport accepted our read receipt.
    #[serde(default)]
    pub read_ack_sent: bool,
}

impl Message {
    /// Fold `incoming` into `self`.  Returns true if anything changed.
    ///
    /// Content and identity fields are immutable once stored; status goes
    /// through [`merge_status`]; timestamps keep the earliest observation and
    /// flags are sticky.
    pub fn absorb(&mut self, incoming: &Message) -> bool {
        let before = self.clone();

        self.status = merge_status(self.status, incoming.status);
        self.delivered_at = earliest(self.delivered_at, incoming.delivered_at);
        self.read_at = earliest(self.read_at, incoming.read_at);
        self.is_deleted |= incoming.is_deleted;
        self.delivery_ack_sent |= incoming.delivery_ack_sent;
        self.read_ack_sent |= incoming.read_ack_sent;

        let changed = *self != before;
        if changed {
            self.updated_at = self.updated_at.max(incoming.updated_at);
        }
        changed
    }

    /// Advance to `status`, stamping the matching timestamp.
    pub fn advance(&mut self, status: MessageStatus, at: DateTime<Utc>) -> bool {
        let next = merge_status(self.status, status);
        if next == self.status {
            return false;
        }
        self.status = next;
        if matches!(next, MessageStatus::Delivered | MessageStatus::Read) && self.delivered_at.is_none() {
            self.delivered_at = Some(at);
        }
        if next == MessageStatus::Read && self.read_at.is_none() {
            self.read_at = Some(at);
        }
        self.updated_at = at;
        true
    }

    /// Receiver copy that the local user has looked at.
    pub fn is_consumed(&self) -> bool {
        !self.is_outgoing && self.read_at.is_some()
    }

    pub fn peer_id(&self) -> &str {
        if self.is_outgoing {
            &self.recipient_id
        } else {
            &self.sender_id
        }
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Per-peer privacy preferences.  Advisory: they gate what this client
/// sends, nothing enforces them on the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyFlags {
    pub read_receipts: bool,
    pub typing_indicators: bool,
    pub last_seen: bool,
}

impl Default for PrivacyFlags {
    fn default() -> Self {
        Self { read_receipts: true, typing_indicators: true, last_seen: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Lexicographically smaller session id of the pair.
    pub participant_a: String,
    pub participant_b: String,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub privacy: PrivacyFlags,
}

impl Conversation {
    pub fn new(id: String, x: &str, y: &str) -> Self {
        let (a, b) = if x <= y { (x, y) } else { (y, x) };
        Self {
            id,
            participant_a: a.to_owned(),
            participant_b: b.to_owned(),
            last_message_at: None,
            unread_count: 0,
            privacy: PrivacyFlags::default(),
        }
    }

    pub fn peer_of(&self, local: &str) -> &str {
        if self.participant_a == local {
            &self.participant_b
        } else {
            &self.participant_a
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(status: MessageStatus) -> Message {
        let t = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        Message {
            id: "m1".into(),
            conversation_id: "c".into(),
            sender_id: "05a".into(),
            recipient_id: "05b".into(),
            content: "hi".into(),
            status,
            created_at: t,
            delivered_at: None,
            read_at: None,
            updated_at: t,
            is_encrypted: true,
            encryption_version: 1,
            is_outgoing: true,
            is_deleted: false,
            delivery_ack_sent: false,
            read_ack_sent: false,
        }
    }

    #[test]
    fn absorb_keeps_higher_status_and_content() {
        let mut stored = msg(MessageStatus::Read);
        let mut incoming = msg(MessageStatus::Delivered);
        incoming.content = "tampered".into();
        assert!(!stored.absorb(&incoming));
        assert_eq!(stored.status, MessageStatus::Read);
        assert_eq!(stored.content, "hi");
    }

    #[test]
    fn advance_stamps_timestamps() {
        let mut m = msg(MessageStatus::Sent);
        let at = Utc::now();
        assert!(m.advance(MessageStatus::Read, at));
        assert_eq!(m.delivered_at, Some(at));
        assert_eq!(m.read_at, Some(at));
        assert!(!m.advance(MessageStatus::Delivered, Utc::now()));
    }

    #[test]
    fn conversation_participants_are_ordered() {
        let c = Conversation::new("c".into(), "05ff", "05aa");
        assert_eq!(c.participant_a, "05aa");
        assert_eq!(c.peer_of("05aa"), "05ff");
        assert_eq!(c.peer_of("05ff"), "05aa");
    }

    #[test]
    fn missing_optional_fields_default() {
        let raw = serde_json::json!({
            "id": "m9", "conversationId": "c", "senderId": "05a", "recipientId": "05b",
            "content": "x", "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"
        });
        let m: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(m.status, MessageStatus::Composed);
        assert!(!m.is_deleted);
    }
}
