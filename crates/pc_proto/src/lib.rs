//! pc_proto: wire types, envelopes, and serialisation for the peer chat client
//!
//! Everything inside a sealed payload is JSON, length-prefixed and padded
//! before AEAD sealing. What the relay sees is a `Notification`: the
//! payload type, the sender, the opaque ciphertext and the checksum.
//!
//! # Modules
//! - `envelope`: plaintext bodies (message envelope, receipts, typing, presence) and the relay-visible notification
//! - `message` : message status, idempotent-max merge, handshake stages
//! - `codec`   : padding and checksummed framing
//! - `api`     : HTTP push relay request/response types

pub mod api;
pub mod codec;
pub mod envelope;
pub mod message;

pub use codec::{CodecError, PaddingMode};
pub use envelope::{now_millis, Envelope, Notification, NotificationType, PresenceSignal, Receipt, TypingSignal};
pub use message::{merge_status, AckKind, HandshakeStage, MessageStatus};
