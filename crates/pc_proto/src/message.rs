//! Message status and the forward-only merge rule.

use serde::{Deserialize, Serialize};

/// Persisted delivery status of a message.
///
/// Ordering used by [`merge_status`]:
///
///   Composed < Error < Sent < Delivered < Read
///
/// `Error` sits just above `Composed`: a failed first send marks the
/// message, while any later proof of progress (a successful resend, a
/// delivery or read receipt) supersedes it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Composed,
    Sent,
    Delivered,
    Read,
    Error,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Composed => 0,
            MessageStatus::Error => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
        }
    }

    /// `Read` is the only state nothing can move past.
    pub fn is_terminal(self) -> bool {
        self == MessageStatus::Read
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Composed => "composed",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Error => "error",
        }
    }
}

/// Idempotent-max merge of two statuses.
///
/// This is the single place status transitions are decided. It is
/// commutative, associative and idempotent, so any permutation or
/// duplication of events converges to the same status and a status
/// never moves backward.
pub fn merge_status(current: MessageStatus, incoming: MessageStatus) -> MessageStatus {
    if incoming.rank() > current.rank() {
        incoming
    } else {
        current
    }
}

/// Which acknowledgment a receipt carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    Delivered,
    Read,
}

impl AckKind {
    pub fn status(self) -> MessageStatus {
        match self {
            AckKind::Delivered => MessageStatus::Delivered,
            AckKind::Read => MessageStatus::Read,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AckKind::Delivered => "delivered",
            AckKind::Read => "read",
        }
    }
}

/// Sender-side handshake stage, derived from the stored status plus
/// whether a transport send is currently in flight.
///
/// `Composed → Sending → AwaitingDelivery → AwaitingRead → Read`, with
/// `Error` reachable before the relay accepts the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeStage {
    Composed,
    Sending,
    AwaitingDelivery,
    AwaitingRead,
    Read,
    Error,
}

impl HandshakeStage {
    pub fn of(status: MessageStatus, in_flight: bool) -> Self {
        match status {
            MessageStatus::Composed | MessageStatus::Error if in_flight => HandshakeStage::Sending,
            MessageStatus::Composed => HandshakeStage::Composed,
            MessageStatus::Error => HandshakeStage::Error,
            MessageStatus::Sent => HandshakeStage::AwaitingDelivery,
            MessageStatus::Delivered => HandshakeStage::AwaitingRead,
            MessageStatus::Read => HandshakeStage::Read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MessageStatus::*;

    const ALL: [MessageStatus; 5] = [Composed, Sent, Delivered, Read, Error];

    #[test]
    fn merge_never_regresses() {
        assert_eq!(merge_status(Read, Delivered), Read);
        assert_eq!(merge_status(Delivered, Sent), Delivered);
        assert_eq!(merge_status(Sent, Composed), Sent);
        assert_eq!(merge_status(Delivered, Error), Delivered);
    }

    #[test]
    fn error_only_from_composed_and_superseded_by_progress() {
        assert_eq!(merge_status(Composed, Error), Error);
        assert_eq!(merge_status(Error, Sent), Sent);
        assert_eq!(merge_status(Error, Read), Read);
        assert_eq!(merge_status(Error, Composed), Error);
    }

    #[test]
    fn merge_is_a_semilattice() {
        for a in ALL {
            assert_eq!(merge_status(a, a), a);
            for b in ALL {
                assert_eq!(merge_status(a, b), merge_status(b, a));
                for c in ALL {
                    assert_eq!(
                        merge_status(merge_status(a, b), c),
                        merge_status(a, merge_status(b, c))
                    );
                }
            }
        }
    }

    #[test]
    fn stage_tracks_in_flight_sends() {
        assert_eq!(HandshakeStage::of(Composed, true), HandshakeStage::Sending);
        assert_eq!(HandshakeStage::of(Error, true), HandshakeStage::Sending);
        assert_eq!(HandshakeStage::of(Sent, false), HandshakeStage::AwaitingDelivery);
        assert_eq!(HandshakeStage::of(Delivered, false), HandshakeStage::AwaitingRead);
        assert!(Read.is_terminal());
    }
}
