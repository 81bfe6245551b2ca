//! Encryption codec: plaintext bodies ⇄ relay notifications.
//!
//! Outbound: `frame (JSON, checksum, pad) → AEAD seal with the pairwise key → base64url`.
//! Inbound:  `base64url → AEAD open (bounded retry) → unpad → checksum → JSON`.
//!
//! AEAD failures surface as `DecryptionFailed`, checksum failures as
//! `ChecksumMismatch`; neither is fatal to the caller.

use std::{sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};

use pc_crypto::{aead, hash};
use pc_proto::{
    codec::{self, PaddingMode},
    Envelope, Notification, NotificationType, PresenceSignal, Receipt, TypingSignal,
};

use crate::{
    config::ClientConfig,
    error::{ChatError, KeyError},
    keys::KeyStore,
};

const ENVELOPE_AAD: &[u8] = b"pc-envelope-v1";

/// A decoded inbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundBody {
    Message(Envelope),
    Receipt(Receipt),
    Typing(TypingSignal),
    Presence(PresenceSignal),
}

pub struct EncryptionCodec {
    keys: Arc<dyn KeyStore>,
    padding: PaddingMode,
    decrypt_attempts: u32,
    retry_delay: Duration,
}

impl EncryptionCodec {
    pub fn new(keys: Arc<dyn KeyStore>, config: &ClientConfig) -> Self {
        Self {
            keys,
            padding: config.padding,
            decrypt_attempts: config.decrypt_attempts.max(1),
            retry_delay: config.decrypt_retry_delay(),
        }
    }

    pub fn keys(&self) -> &Arc<dyn KeyStore> {
        &self.keys
    }

    /// Seal `body` for `peer_id` as a notification of type `kind`.
    pub async fn encode<T: Serialize + Sync>(
        &self,
        peer_id: &str,
        kind: NotificationType,
        body: &T,
    ) -> Result<Notification, ChatError> {
        let framed = codec::frame(body, self.padding)?;
        let sealed = self.keys.seal_for(peer_id, &framed.padded, &aad(kind)).await?;
        Ok(Notification {
            kind,
            sender_id: self.keys.current_session_id().to_string(),
            payload: codec::encode_payload(&sealed),
            checksum: framed.checksum,
        })
    }

    pub async fn encode_envelope(&self, peer_id: &str, envelope: &Envelope) -> Result<Notification, ChatError> {
        self.encode(peer_id, NotificationType::Message, envelope).await
    }

    /// Open and parse one notification body.
    pub async fn decode<T: DeserializeOwned>(&self, notification: &Notification) -> Result<T, ChatError> {
        let sealed = codec::decode_payload(&notification.payload)?;
        let aad = aad(notification.kind);
        let peer = notification.sender_id.as_str();

        let mut last_err = ChatError::DecryptionFailed("no attempt made".into());
        for attempt in 1..=self.decrypt_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }
            let key = match self.keys.shared_key(peer).await {
                Ok(key) => key,
                Err(KeyError::NotFound(p)) => {
                    last_err = ChatError::KeyUnavailable(p);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match aead::decrypt(key.as_bytes(), &sealed, &aad) {
                Ok(padded) => return Ok(codec::unframe(&padded, &notification.checksum)?),
                Err(e) => {
                    tracing::debug!(
                        target: "pc_client",
                        event = "decrypt_attempt_failed",
                        peer_id = %peer,
                        attempt,
                        error = %e
                    );
                    last_err = ChatError::DecryptionFailed(e.to_string());
                }
            }
        }
        Err(last_err)
    }

    /// Decode by notification type and check the inner sender matches the outer one.
    pub async fn decode_notification(&self, notification: &Notification) -> Result<InboundBody, ChatError> {
        let outer = notification.sender_id.as_str();
        let (body, inner) = match notification.kind {
            NotificationType::Message => {
                let env: Envelope = self.decode(notification).await?;
                let expected = hash::conversation_id(self.keys.current_session_id().as_str(), outer);
                if env.conversation_id != expected {
                    return Err(ChatError::DecryptionFailed("conversation id mismatch".into()));
                }
                let inner = env.sender_id.clone();
                (InboundBody::Message(env), inner)
            }
            NotificationType::DeliveryReceipt | NotificationType::ReadReceipt => {
                let receipt: Receipt = self.decode(notification).await?;
                if NotificationType::for_ack(receipt.kind) != notification.kind {
                    return Err(ChatError::DecryptionFailed("receipt kind mismatch".into()));
                }
                receipt
                    .verify()
                    .map_err(|e| ChatError::DecryptionFailed(format!("receipt signature: {e}")))?;
                let inner = receipt.sender_id.clone();
                (InboundBody::Receipt(receipt), inner)
            }
            NotificationType::TypingIndicator => {
                let signal: TypingSignal = self.decode(notification).await?;
                let inner = signal.sender_id.clone();
                (InboundBody::Typing(signal), inner)
            }
            NotificationType::PresenceUpdate => {
                let signal: PresenceSignal = self.decode(notification).await?;
                let inner = signal.sender_id.clone();
                (InboundBody::Presence(signal), inner)
            }
        };
        if inner != outer {
            return Err(ChatError::DecryptionFailed(format!(
                "sender mismatch: notification={outer} body={inner}"
            )));
        }
        Ok(body)
    }
}

fn aad(kind: NotificationType) -> Vec<u8> {
    let mut out = ENVELOPE_AAD.to_vec();
    out.push(0);
    out.extend_from_slice(kind.as_str().as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, keys::LocalKeyStore};
    use pc_crypto::IdentityKeyPair;
    use pc_proto::now_millis;

    fn codecs() -> (EncryptionCodec, EncryptionCodec, Arc<LocalKeyStore>, Arc<LocalKeyStore>) {
        let a = Arc::new(LocalKeyStore::new(IdentityKeyPair::generate()).unwrap());
        let b = Arc::new(LocalKeyStore::new(IdentityKeyPair::generate()).unwrap());
        a.add_contact(b.current_session_id().as_str()).unwrap();
        b.add_contact(a.current_session_id().as_str()).unwrap();
        let cfg = ClientConfig { decrypt_retry_delay_ms: 1, ..ClientConfig::default() };
        (
            EncryptionCodec::new(a.clone(), &cfg),
            EncryptionCodec::new(b.clone(), &cfg),
            a,
            b,
        )
    }

    fn envelope(from: &LocalKeyStore, to: &LocalKeyStore) -> Envelope {
        let me = from.current_session_id().to_string();
        let peer = to.current_session_id().to_string();
        Envelope {
            message_id: "m1".into(),
            conversation_id: hash::conversation_id(&me, &peer),
            sender_id: me,
            message: "hello".into(),
            sender_name: "alice".into(),
            timestamp: now_millis(),
        }
    }

    #[tokio::test]
    async fn envelope_round_trips() {
        let (ca, cb, a, b) = codecs();
        let env = envelope(&a, &b);
        let n = ca.encode_envelope(b.current_session_id().as_str(), &env).await.unwrap();
        assert!(!n.payload.contains("hello"));
        assert_eq!(cb.decode_notification(&n).await.unwrap(), InboundBody::Message(env));
    }

    #[tokio::test]
    async fn every_single_bit_flip_is_detected() {
        let (ca, cb, a, b) = codecs();
        let env = envelope(&a, &b);
        let n = ca.encode_envelope(b.current_session_id().as_str(), &env).await.unwrap();
        let sealed = codec::decode_payload(&n.payload).unwrap();
        for i in (0..sealed.len()).step_by(7) {
            let mut corrupted = sealed.clone();
            corrupted[i] ^= 0x01;
            let bad = Notification { payload: codec::encode_payload(&corrupted), ..n.clone() };
            let err = cb.decode_notification(&bad).await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::DecryptionFailed | ErrorKind::ChecksumMismatch));
        }
    }

    #[tokio::test]
    async fn wrong_checksum_is_reported_as_mismatch() {
        let (ca, cb, a, b) = codecs();
        let n = ca
            .encode_envelope(b.current_session_id().as_str(), &envelope(&a, &b))
            .await
            .unwrap();
        let bad = Notification { checksum: hash::checksum(b"something else"), ..n };
        assert_eq!(cb.decode_notification(&bad).await.unwrap_err().kind(), ErrorKind::ChecksumMismatch);
    }

    #[tokio::test]
    async fn relabelled_type_fails_to_open() {
        let (ca, cb, a, b) = codecs();
        let signal = TypingSignal {
            sender_id: a.current_session_id().to_string(),
            is_typing: true,
            timestamp: now_millis(),
        };
        let mut n = ca
            .encode(b.current_session_id().as_str(), NotificationType::TypingIndicator, &signal)
            .await
            .unwrap();
        n.kind = NotificationType::PresenceUpdate;
        assert_eq!(cb.decode_notification(&n).await.unwrap_err().kind(), ErrorKind::DecryptionFailed);
    }

    #[tokio::test]
    async fn spoofed_outer_sender_is_rejected() {
        let (_ca, _cb, a, b) = codecs();
        let mallory = Arc::new(LocalKeyStore::new(IdentityKeyPair::generate()).unwrap());
        b.add_contact(mallory.current_session_id().as_str()).unwrap();
        mallory.add_contact(b.current_session_id().as_str()).unwrap();
        let cm = EncryptionCodec::new(mallory.clone(), &ClientConfig::default());

        // Mallory claims to be Alice in the body.
        let signal = TypingSignal {
            sender_id: a.current_session_id().to_string(),
            is_typing: true,
            timestamp: now_millis(),
        };
        let n = cm
            .encode(b.current_session_id().as_str(), NotificationType::TypingIndicator, &signal)
            .await
            .unwrap();
        let cb = EncryptionCodec::new(b.clone(), &ClientConfig::default());
        assert!(cb.decode_notification(&n).await.is_err());
    }

    #[tokio::test]
    async fn unknown_sender_is_key_unavailable() {
        let (ca, _cb, _a, b) = codecs();
        let stranger = LocalKeyStore::new(IdentityKeyPair::generate()).unwrap();
        let cfg = ClientConfig { decrypt_retry_delay_ms: 1, ..ClientConfig::default() };
        let cs = EncryptionCodec::new(Arc::new(stranger), &cfg);
        let signal = PresenceSignal {
            sender_id: "05ab".into(),
            online: true,
            timestamp: now_millis(),
        };
        let n = ca
            .encode(b.current_session_id().as_str(), NotificationType::PresenceUpdate, &signal)
            .await
            .unwrap();
        assert_eq!(cs.decode_notification(&n).await.unwrap_err().kind(), ErrorKind::KeyUnavailable);
    }
}
