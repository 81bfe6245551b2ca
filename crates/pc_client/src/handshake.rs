//! Delivery handshake: send → delivery receipt → read receipt, plus typing
//! and presence signals.
//!
//! Status only ever moves through `MessageRepository`, which folds every
//! change through `pc_proto::merge_status`, so duplicated or reordered
//! receipts can never move a message backward.
//!
//! Ack failures are logged and parked as `PendingAck` entries with an
//! exponential retry time. They are retried when the peer next sends us
//! something or on `reconcile`, never in a tight loop.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Weak},
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};

use pc_crypto::hash;
use pc_proto::{
    envelope::ENVELOPE_VERSION, now_millis, AckKind, Envelope, HandshakeStage, MessageStatus, NotificationType,
    PresenceSignal, Receipt, TypingSignal,
};
use pc_store::{Message, MessageRepository, PrivacyFlags};

use crate::{
    codec::{EncryptionCodec, InboundBody},
    config::{ClientConfig, ReconnectPolicy},
    error::ChatError,
    events::InboundEvent,
    keys::{normalize_peer_id, KeyStore},
    transport::{RejectReason, SendOutcome, TransportRouter},
    typing::{TypingDebouncer, TypingTracker, TypingTransition},
    ui::{UiEvent, UiHub},
};

/// What a pending entry is waiting to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingAction {
    /// Re-send our own message until the peer's delivery receipt arrives.
    Resend,
    /// Send a receipt we owe the peer.
    Ack(AckKind),
}

#[derive(Debug, Clone)]
pub struct PendingAck {
    pub message_id: String,
    pub peer_id: String,
    pub action: PendingAction,
    pub attempts: u32,
    pub next_retry_at: Instant,
}

type PendingKey = (String, PendingAction);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Messages re-sent because no delivery receipt arrived.
    pub resent: usize,
    /// Message ids covered by delivery receipts sent in this pass.
    pub delivery_acks: usize,
    /// Message ids covered by read receipts sent in this pass.
    pub read_acks: usize,
    /// Candidates skipped because their retry time has not come yet.
    pub deferred: usize,
}

#[derive(Default)]
struct AckFlush {
    delivery_acks: usize,
    read_acks: usize,
    deferred: usize,
    live: HashSet<PendingKey>,
}

const PENDING_BACKOFF: ReconnectPolicy =
    ReconnectPolicy { max_attempts: u32::MAX, initial_backoff_ms: 5_000, max_backoff_ms: 600_000 };

pub struct HandshakeProtocol {
    config: ClientConfig,
    keys: Arc<dyn KeyStore>,
    codec: EncryptionCodec,
    repo: Arc<MessageRepository>,
    router: Arc<TransportRouter>,
    ui: Arc<UiHub>,
    typing: TypingTracker,
    debouncer: TypingDebouncer,
    typing_rx: Mutex<Option<mpsc::UnboundedReceiver<TypingTransition>>>,
    pending: Mutex<HashMap<PendingKey, PendingAck>>,
    in_flight: Mutex<HashSet<String>>,
}

impl HandshakeProtocol {
    pub fn new(
        config: ClientConfig,
        keys: Arc<dyn KeyStore>,
        repo: Arc<MessageRepository>,
        router: Arc<TransportRouter>,
        ui: Arc<UiHub>,
    ) -> Self {
        let codec = EncryptionCodec::new(keys.clone(), &config);
        let typing = TypingTracker::new(config.typing_expiry(), ui.clone());
        let (debouncer, typing_rx) = TypingDebouncer::new(config.typing_idle());
        Self {
            config,
            keys,
            codec,
            repo,
            router,
            ui,
            typing,
            debouncer,
            typing_rx: Mutex::new(Some(typing_rx)),
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn local_id(&self) -> &str {
        self.keys.current_session_id().as_str()
    }

    pub fn conversation_with(&self, peer_id: &str) -> String {
        let peer_id: &str = &normalize_peer_id(peer_id);
        hash::conversation_id(self.local_id(), peer_id)
    }

    // ── Step 1: send ─────────────────────────────────────────────────────────

    /// Compose, store and transmit a message.  Transport or key failures
    /// leave the message stored with status `Error`; they are not retried
    /// automatically.
    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<Message, ChatError> {
        let peer_id: &str = &normalize_peer_id(peer_id);
        let local = self.local_id().to_owned();
        let conversation_id = self.conversation_with(peer_id);
        self.repo.ensure_conversation(&conversation_id, &local, peer_id).await?;

        let now = now_millis();
        let message = Message {
            id: hash::short_message_id(),
            conversation_id: conversation_id.clone(),
            sender_id: local,
            recipient_id: peer_id.to_owned(),
            content: text.to_owned(),
            status: MessageStatus::Composed,
            created_at: now,
            delivered_at: None,
            read_at: None,
            updated_at: now,
            is_encrypted: true,
            encryption_version: ENVELOPE_VERSION,
            is_outgoing: true,
            is_deleted: false,
            delivery_ack_sent: false,
            read_ack_sent: false,
        };
        let stored = self.repo.upsert_message(message).await?.message;
        self.ui.publish(UiEvent::ConversationChanged { conversation_id });
        self.notify_status(&stored);

        self.debouncer.input_cleared(peer_id);
        self.transmit(stored).await
    }

    /// User-triggered retry of a message that is not yet delivered.
    pub async fn resend(&self, message_id: &str) -> Result<Message, ChatError> {
        let message = self
            .repo
            .get_message(message_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {message_id}")))?;
        if !message.is_outgoing || matches!(message.status, MessageStatus::Delivered | MessageStatus::Read) {
            return Ok(message);
        }
        self.transmit(message).await
    }

    async fn transmit(&self, message: Message) -> Result<Message, ChatError> {
        self.in_flight.lock().insert(message.id.clone());
        let outcome = self.deliver_envelope(&message).await;
        self.in_flight.lock().remove(&message.id);

        let status = match &outcome {
            Ok(()) => {
                tracing::info!(
                    target: "pc_client",
                    event = "send_message_ok",
                    message_id = %message.id,
                    peer_id = %message.recipient_id
                );
                MessageStatus::Sent
            }
            Err(err) => {
                tracing::warn!(
                    target: "pc_client",
                    event = "send_message_failed",
                    message_id = %message.id,
                    peer_id = %message.recipient_id,
                    error = %err
                );
                if let ChatError::KeyUnavailable(_) = err {
                    self.ui.publish(UiEvent::KeyExchangeRequested { peer_id: message.recipient_id.clone() });
                }
                MessageStatus::Error
            }
        };

        let updated = self.repo.set_status(&message.id, status).await?.unwrap_or(message);
        self.notify_status(&updated);
        Ok(updated)
    }

    async fn deliver_envelope(&self, message: &Message) -> Result<(), ChatError> {
        let envelope = Envelope {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            conversation_id: message.conversation_id.clone(),
            message: message.content.clone(),
            sender_name: self.config.sender_name.clone(),
            timestamp: message.created_at,
        };
        let notification = self.codec.encode_envelope(&message.recipient_id, &envelope).await?;
        match self.router.send(&message.recipient_id, &notification).await {
            SendOutcome::Accepted => Ok(()),
            SendOutcome::Rejected(RejectReason::Timeout) => Err(ChatError::TransportTimeout),
            SendOutcome::Rejected(reason) => Err(ChatError::TransportRejected(reason.to_string())),
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Process one inbound notification.  Undecryptable or inconsistent
    /// events are dropped with a warning; only store failures are returned.
    pub async fn handle_inbound(&self, event: &InboundEvent) -> Result<(), ChatError> {
        let notification = &event.notification;
        let peer = notification.sender_id.as_str();
        if peer == self.local_id() {
            return Ok(());
        }

        let body = match self.codec.decode_notification(notification).await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    target: "pc_client",
                    event = "inbound_dropped",
                    kind = notification.kind.as_str(),
                    peer_id = %peer,
                    error = %err
                );
                self.ui.warn(&self.conversation_with(peer), &err);
                return Ok(());
            }
        };

        match body {
            InboundBody::Message(envelope) => self.on_message(envelope).await?,
            InboundBody::Receipt(receipt) => self.on_receipt(receipt).await?,
            InboundBody::Typing(signal) => self.typing.apply(&signal.sender_id, signal.is_typing, signal.timestamp),
            InboundBody::Presence(signal) => self.ui.publish(UiEvent::Presence {
                peer_id: signal.sender_id,
                online: signal.online,
            }),
        }

        if !notification.kind.is_ephemeral() {
            // The peer is reachable again: settle receipts we still owe it.
            self.flush_owed_acks(Some(peer)).await?;
        }
        Ok(())
    }

    // ── Step 2: delivery receipt ─────────────────────────────────────────────

    async fn on_message(&self, envelope: Envelope) -> Result<(), ChatError> {
        let peer = envelope.sender_id.clone();
        let local = self.local_id().to_owned();

        if let Some(existing) = self.repo.get_message(&envelope.message_id).await? {
            if existing.is_outgoing || existing.sender_id != peer {
                tracing::warn!(
                    target: "pc_client",
                    event = "message_id_collision",
                    message_id = %envelope.message_id,
                    peer_id = %peer
                );
                return Ok(());
            }
        }

        let now = now_millis();
        let incoming = Message {
            id: envelope.message_id.clone(),
            conversation_id: envelope.conversation_id.clone(),
            sender_id: peer.clone(),
            recipient_id: local,
            content: envelope.message,
            status: MessageStatus::Delivered,
            created_at: envelope.timestamp,
            delivered_at: Some(now),
            read_at: None,
            updated_at: now,
            is_encrypted: true,
            encryption_version: ENVELOPE_VERSION,
            is_outgoing: false,
            is_deleted: false,
            delivery_ack_sent: false,
            read_ack_sent: false,
        };
        let upserted = self.repo.upsert_message(incoming).await?;
        if upserted.created {
            tracing::info!(
                target: "pc_client",
                event = "message_received",
                message_id = %envelope.message_id,
                peer_id = %peer
            );
            self.ui.publish(UiEvent::ConversationChanged { conversation_id: envelope.conversation_id.clone() });
        } else {
            tracing::debug!(target: "pc_client", event = "duplicate_message", message_id = %envelope.message_id);
        }
        self.typing.apply(&peer, false, envelope.timestamp);

        // Duplicates are re-acked: the sender only re-sends when our receipt got lost.
        self.send_ack(&peer, AckKind::Delivered, vec![envelope.message_id]).await;

        if self.ui.is_active(&envelope.conversation_id) {
            self.mark_conversation_read(&peer).await?;
        }
        Ok(())
    }

    async fn on_receipt(&self, receipt: Receipt) -> Result<(), ChatError> {
        let requested: HashSet<String> = receipt.message_ids.iter().cloned().collect();
        let ours: HashSet<String> = self
            .repo
            .get_messages(&requested)
            .await?
            .into_iter()
            .filter(|m| m.is_outgoing && m.recipient_id == receipt.sender_id)
            .map(|m| m.id)
            .collect();
        if ours.len() < requested.len() {
            tracing::debug!(
                target: "pc_client",
                event = "receipt_unknown_ids",
                kind = receipt.kind.as_str(),
                unknown = requested.len() - ours.len()
            );
        }

        let changed = match receipt.kind {
            AckKind::Delivered => self.repo.mark_delivered(&ours).await?,
            AckKind::Read => self.repo.mark_read(&ours).await?,
        };
        for message in &changed {
            self.notify_status(message);
        }
        {
            let mut pending = self.pending.lock();
            for id in &ours {
                pending.remove(&(id.clone(), PendingAction::Resend));
            }
        }
        tracing::info!(
            target: "pc_client",
            event = "receipt_applied",
            kind = receipt.kind.as_str(),
            peer_id = %receipt.sender_id,
            changed = changed.len()
        );
        Ok(())
    }

    /// Sign, seal and send one receipt batch.  Failures are logged and
    /// parked; the caller never sees them.
    async fn send_ack(&self, peer_id: &str, kind: AckKind, ids: Vec<String>) -> bool {
        if ids.is_empty() {
            return true;
        }
        let receipt = Receipt::signed(kind, ids.clone(), self.keys.current_session_id(), self.keys.identity());
        let outcome = match self.codec.encode(peer_id, NotificationType::for_ack(kind), &receipt).await {
            Ok(notification) => self.router.send(peer_id, &notification).await,
            Err(err) => SendOutcome::Rejected(RejectReason::Relay(err.to_string())),
        };

        match outcome {
            SendOutcome::Accepted => {
                if let Err(err) = self.repo.mark_ack_sent(&ids, kind).await {
                    tracing::warn!(target: "pc_client", event = "ack_flag_failed", error = %err);
                }
                let mut pending = self.pending.lock();
                for id in &ids {
                    pending.remove(&(id.clone(), PendingAction::Ack(kind)));
                }
                tracing::debug!(
                    target: "pc_client",
                    event = "ack_sent",
                    kind = kind.as_str(),
                    peer_id = %peer_id,
                    count = ids.len()
                );
                true
            }
            SendOutcome::Rejected(reason) => {
                tracing::warn!(
                    target: "pc_client",
                    event = "ack_send_failed",
                    kind = kind.as_str(),
                    peer_id = %peer_id,
                    count = ids.len(),
                    reason = %reason
                );
                self.defer(&ids, peer_id, PendingAction::Ack(kind));
                false
            }
        }
    }

    // ── Step 3: read receipt ─────────────────────────────────────────────────

    /// The local user opened the conversation with `peer_id`.  All inbound
    /// messages not yet consumed are acknowledged in one read receipt.
    /// Returns the consumed message ids.
    pub async fn mark_conversation_read(&self, peer_id: &str) -> Result<Vec<String>, ChatError> {
        let peer_id: &str = &normalize_peer_id(peer_id);
        let conversation_id = self.conversation_with(peer_id);
        let consumed = self.repo.mark_consumed(&conversation_id).await?;
        if consumed.is_empty() {
            return Ok(Vec::new());
        }
        self.ui.publish(UiEvent::ConversationChanged { conversation_id: conversation_id.clone() });

        let ids: Vec<String> = consumed.into_iter().map(|m| m.id).collect();
        if self.privacy(&conversation_id).await?.read_receipts {
            self.send_ack(peer_id, AckKind::Read, ids.clone()).await;
        } else {
            tracing::debug!(target: "pc_client", event = "read_receipt_suppressed", peer_id = %peer_id);
            self.repo.mark_ack_sent(&ids, AckKind::Read).await?;
        }
        Ok(ids)
    }

    // ── Typing & presence ────────────────────────────────────────────────────

    pub async fn input_changed(&self, peer_id: &str) -> Result<(), ChatError> {
        let peer_id: &str = &normalize_peer_id(peer_id);
        if self.privacy(&self.conversation_with(peer_id)).await?.typing_indicators {
            self.debouncer.input_changed(peer_id);
        }
        Ok(())
    }

    pub fn input_cleared(&self, peer_id: &str) {
        let peer_id: &str = &normalize_peer_id(peer_id);
        self.debouncer.input_cleared(peer_id);
    }

    pub fn is_peer_typing(&self, peer_id: &str) -> bool {
        let peer_id: &str = &normalize_peer_id(peer_id);
        self.typing.is_typing(peer_id)
    }

    /// Forward debounced local typing transitions to peers.  Runs until the
    /// protocol is dropped; only one sender task can be started.
    pub fn spawn_typing_sender(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.typing_rx.lock().take()?;
        let weak: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(transition) = rx.recv().await {
                let Some(protocol) = weak.upgrade() else { break };
                protocol.send_typing(&transition.peer_id, transition.is_typing).await;
            }
        }))
    }

    async fn send_typing(&self, peer_id: &str, is_typing: bool) {
        let signal = TypingSignal { sender_id: self.local_id().to_owned(), is_typing, timestamp: now_millis() };
        let outcome = match self.codec.encode(peer_id, NotificationType::TypingIndicator, &signal).await {
            Ok(n) => self.router.send(peer_id, &n).await,
            Err(err) => SendOutcome::Rejected(RejectReason::Relay(err.to_string())),
        };
        if let SendOutcome::Rejected(reason) = outcome {
            tracing::debug!(target: "pc_client", event = "typing_not_sent", peer_id = %peer_id, reason = %reason);
        }
    }

    /// Tell every peer that allows last-seen whether we are online.
    /// Returns how many peers accepted the signal.
    pub async fn broadcast_presence(&self, online: bool) -> Result<usize, ChatError> {
        let local = self.local_id().to_owned();
        let mut sent = 0;
        for conversation in self.repo.list_conversations().await? {
            if !conversation.privacy.last_seen {
                continue;
            }
            let peer = conversation.peer_of(&local).to_owned();
            let signal = PresenceSignal { sender_id: local.clone(), online, timestamp: now_millis() };
            let outcome = match self.codec.encode(&peer, NotificationType::PresenceUpdate, &signal).await {
                Ok(n) => self.router.send(&peer, &n).await,
                Err(err) => SendOutcome::Rejected(RejectReason::Relay(err.to_string())),
            };
            if outcome.is_accepted() {
                sent += 1;
            }
        }
        tracing::debug!(target: "pc_client", event = "presence_broadcast", online, peers = sent);
        Ok(sent)
    }

    // ── Reconciliation ───────────────────────────────────────────────────────

    /// Re-derive pending work from stored state after a connectivity gap:
    /// re-send our messages still waiting for a delivery receipt, and send
    /// the delivery/read receipts we still owe.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ChatError> {
        let cutoff = Utc::now() - self.config.resend_after();
        let mut report = ReconcileReport::default();
        let mut live: HashSet<PendingKey> = HashSet::new();

        for message in self.repo.outbound_awaiting_delivery(cutoff).await? {
            let key = (message.id.clone(), PendingAction::Resend);
            live.insert(key.clone());
            if !self.is_due(&key) {
                report.deferred += 1;
                continue;
            }
            let result = self.deliver_envelope(&message).await;
            self.defer(&[message.id.clone()], &message.recipient_id, PendingAction::Resend);
            match result {
                Ok(()) => {
                    report.resent += 1;
                    tracing::info!(
                        target: "pc_client",
                        event = "reconcile_resend",
                        message_id = %message.id,
                        peer_id = %message.recipient_id
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target: "pc_client",
                        event = "reconcile_resend_failed",
                        message_id = %message.id,
                        error = %err
                    );
                }
            }
        }

        let flush = self.flush_owed_acks(None).await?;
        report.delivery_acks = flush.delivery_acks;
        report.read_acks = flush.read_acks;
        report.deferred += flush.deferred;
        live.extend(flush.live);

        self.pending.lock().retain(|key, _| live.contains(key));
        tracing::info!(
            target: "pc_client",
            event = "reconcile_done",
            resent = report.resent,
            delivery_acks = report.delivery_acks,
            read_acks = report.read_acks,
            deferred = report.deferred
        );
        Ok(report)
    }

    async fn flush_owed_acks(&self, only_peer: Option<&str>) -> Result<AckFlush, ChatError> {
        let owed = self.repo.inbound_needing_acks().await?;
        if owed.is_empty() {
            return Ok(AckFlush::default());
        }
        let privacy: HashMap<String, PrivacyFlags> = self
            .repo
            .list_conversations()
            .await?
            .into_iter()
            .map(|c| (c.id, c.privacy))
            .collect();

        let mut flush = AckFlush::default();
        let mut suppressed = Vec::new();
        let mut batches: BTreeMap<String, (Vec<String>, Vec<String>)> = BTreeMap::new();
        for m in owed {
            if only_peer.is_some_and(|p| p != m.sender_id) {
                continue;
            }
            if !m.delivery_ack_sent {
                let key = (m.id.clone(), PendingAction::Ack(AckKind::Delivered));
                flush.live.insert(key.clone());
                if self.is_due(&key) {
                    batches.entry(m.sender_id.clone()).or_default().0.push(m.id.clone());
                } else {
                    flush.deferred += 1;
                }
            }
            if m.is_consumed() && !m.read_ack_sent {
                let allowed = privacy.get(&m.conversation_id).map_or(true, |p| p.read_receipts);
                if !allowed {
                    suppressed.push(m.id.clone());
                    continue;
                }
                let key = (m.id.clone(), PendingAction::Ack(AckKind::Read));
                flush.live.insert(key.clone());
                if self.is_due(&key) {
                    batches.entry(m.sender_id.clone()).or_default().1.push(m.id.clone());
                } else {
                    flush.deferred += 1;
                }
            }
        }

        if !suppressed.is_empty() {
            self.repo.mark_ack_sent(&suppressed, AckKind::Read).await?;
        }
        for (peer, (delivered, read)) in batches {
            let (d, r) = (delivered.len(), read.len());
            if self.send_ack(&peer, AckKind::Delivered, delivered).await {
                flush.delivery_acks += d;
            }
            if self.send_ack(&peer, AckKind::Read, read).await {
                flush.read_acks += r;
            }
        }
        Ok(flush)
    }

    fn is_due(&self, key: &PendingKey) -> bool {
        self.pending.lock().get(key).map_or(true, |p| p.next_retry_at <= Instant::now())
    }

    fn defer(&self, ids: &[String], peer_id: &str, action: PendingAction) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        for id in ids {
            let entry = pending.entry((id.clone(), action)).or_insert_with(|| PendingAck {
                message_id: id.clone(),
                peer_id: peer_id.to_owned(),
                action,
                attempts: 0,
                next_retry_at: now,
            });
            entry.attempts += 1;
            entry.next_retry_at = now + PENDING_BACKOFF.base_delay(entry.attempts);
        }
    }

    /// Snapshot of parked work, for diagnostics.
    pub fn pending(&self) -> Vec<PendingAck> {
        self.pending.lock().values().cloned().collect()
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub async fn stage(&self, message_id: &str) -> Result<Option<HandshakeStage>, ChatError> {
        let in_flight = self.in_flight.lock().contains(message_id);
        Ok(self
            .repo
            .get_message(message_id)
            .await?
            .map(|m| HandshakeStage::of(m.status, in_flight)))
    }

    pub async fn messages_with(&self, peer_id: &str) -> Result<Vec<Message>, ChatError> {
        let peer_id: &str = &normalize_peer_id(peer_id);
        Ok(self.repo.list_by_conversation(&self.conversation_with(peer_id)).await?)
    }

    async fn privacy(&self, conversation_id: &str) -> Result<PrivacyFlags, ChatError> {
        Ok(self
            .repo
            .conversation(conversation_id)
            .await?
            .map(|c| c.privacy)
            .unwrap_or_default())
    }

    fn notify_status(&self, message: &Message) {
        self.ui.publish(UiEvent::MessageStatusChanged {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            status: message.status,
            icon: message.status.into(),
        });
    }

    /// Cancel typing timers and forget local typing state.
    pub fn shutdown(&self) {
        self.typing.clear();
        self.debouncer.clear();
    }
}
