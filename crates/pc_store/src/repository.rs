//! Message repository: the only writer of stored messages and conversations.
//!
//! Records live in two lists, `"messages"` and `"chats"`. Every write is a
//! read-modify-write under one async mutex, so concurrent upserts of the
//! same id serialise and the status merge never loses a higher status.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use pc_proto::{AckKind, MessageStatus};

use crate::{
    error::StoreError,
    models::{Conversation, Message, PrivacyFlags},
    records::{Record, RecordStore},
};

const MESSAGES_KEY: &str = "messages";
const CHATS_KEY: &str = "chats";

/// Result of [`MessageRepository::upsert_message`].
#[derive(Debug, Clone)]
pub struct Upserted {
    /// The stored record after the merge.
    pub message: Message,
    /// No record with this id existed before.
    pub created: bool,
    /// The stored record differs from what was there before.
    pub changed: bool,
}

pub struct MessageRepository {
    store: Arc<dyn RecordStore>,
    write: Mutex<()>,
}

impl MessageRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, write: Mutex::new(()) }
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    /// Insert or merge by id.  A new inbound message bumps the conversation's
    /// unread count; any new message bumps `last_message_at`.
    pub async fn upsert_message(&self, message: Message) -> Result<Upserted, StoreError> {
        let _guard = self.write.lock().await;
        let mut messages: Vec<Message> = self.load(MESSAGES_KEY).await?;

        let result = match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                let changed = existing.absorb(&message);
                Upserted { message: existing.clone(), created: false, changed }
            }
            None => {
                messages.push(message.clone());
                Upserted { message, created: true, changed: true }
            }
        };

        if result.changed {
            self.save(MESSAGES_KEY, &messages).await?;
        }
        if result.created {
            self.touch_conversation(&result.message).await?;
        }
        Ok(result)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let messages: Vec<Message> = self.load(MESSAGES_KEY).await?;
        Ok(messages.into_iter().find(|m| m.id == id))
    }

    pub async fn get_messages(&self, ids: &HashSet<String>) -> Result<Vec<Message>, StoreError> {
        let messages: Vec<Message> = self.load(MESSAGES_KEY).await?;
        Ok(messages.into_iter().filter(|m| ids.contains(&m.id)).collect())
    }

    /// Visible messages of one conversation, oldest first.
    pub async fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut messages: Vec<Message> = self
            .load::<Message>(MESSAGES_KEY)
            .await?
            .into_iter()
            .filter(|m| m.conversation_id == conversation_id && !m.is_deleted)
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Advance the given messages to `Read`.  Returns the records that changed.
    pub async fn mark_read(&self, ids: &HashSet<String>) -> Result<Vec<Message>, StoreError> {
        self.advance_all(ids, MessageStatus::Read).await
    }

    /// Advance the given messages to `Delivered`.  Returns the records that changed.
    pub async fn mark_delivered(&self, ids: &HashSet<String>) -> Result<Vec<Message>, StoreError> {
        self.advance_all(ids, MessageStatus::Delivered).await
    }

    async fn advance_all(
        &self,
        ids: &HashSet<String>,
        status: MessageStatus,
    ) -> Result<Vec<Message>, StoreError> {
        let _guard = self.write.lock().await;
        let mut messages: Vec<Message> = self.load(MESSAGES_KEY).await?;
        let now = Utc::now();
        let changed: Vec<Message> = messages
            .iter_mut()
            .filter(|m| ids.contains(&m.id))
            .filter_map(|m| m.advance(status, now).then(|| m.clone()))
            .collect();
        if !changed.is_empty() {
            self.save(MESSAGES_KEY, &messages).await?;
        }
        Ok(changed)
    }

    /// Set `status` unconditionally through the merge (e.g. `Sent`, `Error`).
    pub async fn set_status(&self, id: &str, status: MessageStatus) -> Result<Option<Message>, StoreError> {
        let ids = HashSet::from([id.to_owned()]);
        let changed = self.advance_all(&ids, status).await?;
        match changed.into_iter().next() {
            Some(m) => Ok(Some(m)),
            None => self.get_message(id).await,
        }
    }

    /// The local user looked at a conversation.  Stamps `read_at` on every
    /// inbound message not yet consumed and clears the unread count.
    /// Returns the newly consumed messages.  Status stays `Delivered`: `Read`
    /// on a receiver copy is never set, the sender's copy tracks it.
    pub async fn mark_consumed(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let _guard = self.write.lock().await;
        let mut messages: Vec<Message> = self.load(MESSAGES_KEY).await?;
        let now = Utc::now();
        let mut consumed = Vec::new();
        for m in messages.iter_mut().filter(|m| {
            m.conversation_id == conversation_id && !m.is_outgoing && !m.is_deleted && m.read_at.is_none()
        }) {
            m.read_at = Some(now);
            m.updated_at = now;
            consumed.push(m.clone());
        }
        if !consumed.is_empty() {
            self.save(MESSAGES_KEY, &messages).await?;
        }

        let mut chats: Vec<Conversation> = self.load(CHATS_KEY).await?;
        if let Some(c) = chats.iter_mut().find(|c| c.id == conversation_id) {
            if c.unread_count != 0 {
                c.unread_count = 0;
                self.save(CHATS_KEY, &chats).await?;
            }
        }
        Ok(consumed)
    }

    /// Record that the transport accepted our receipt for these inbound messages.
    pub async fn mark_ack_sent(&self, ids: &[String], kind: AckKind) -> Result<(), StoreError> {
        let _guard = self.write.lock().await;
        let mut messages: Vec<Message> = self.load(MESSAGES_KEY).await?;
        let mut dirty = false;
        for m in messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            let flag = match kind {
                AckKind::Delivered => &mut m.delivery_ack_sent,
                AckKind::Read => &mut m.read_ack_sent,
            };
            if !*flag {
                *flag = true;
                dirty = true;
            }
        }
        if dirty {
            self.save(MESSAGES_KEY, &messages).await?;
        }
        Ok(())
    }

    /// Hide a message from listings.  The record is kept so a late duplicate
    /// cannot resurrect it.
    pub async fn soft_delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write.lock().await;
        let mut messages: Vec<Message> = self.load(MESSAGES_KEY).await?;
        let Some(m) = messages.iter_mut().find(|m| m.id == id && !m.is_deleted) else {
            return Ok(false);
        };
        m.is_deleted = true;
        m.updated_at = Utc::now();
        self.save(MESSAGES_KEY, &messages).await?;
        Ok(true)
    }

    /// Wipe every message and conversation.
    pub async fn delete_all(&self) -> Result<(), StoreError> {
        let _guard = self.write.lock().await;
        self.store.remove(MESSAGES_KEY).await?;
        self.store.remove(CHATS_KEY).await?;
        tracing::info!(target: "pc_store", event = "repository_wiped");
        Ok(())
    }

    // ── Reconciliation queries ───────────────────────────────────────────────

    /// Our own messages the relay accepted but the peer has not acknowledged,
    /// created no later than `older_than`.
    pub async fn outbound_awaiting_delivery(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .load::<Message>(MESSAGES_KEY)
            .await?
            .into_iter()
            .filter(|m| {
                m.is_outgoing && !m.is_deleted && m.status == MessageStatus::Sent && m.created_at <= older_than
            })
            .collect())
    }

    /// Inbound messages whose delivery receipt, or read receipt once consumed,
    /// has not been accepted by the transport yet.
    pub async fn inbound_needing_acks(&self) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .load::<Message>(MESSAGES_KEY)
            .await?
            .into_iter()
            .filter(|m| !m.is_outgoing && (!m.delivery_ack_sent || (m.is_consumed() && !m.read_ack_sent)))
            .collect())
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Get or create the conversation for an unordered participant pair.
    pub async fn ensure_conversation(
        &self,
        id: &str,
        local: &str,
        peer: &str,
    ) -> Result<Conversation, StoreError> {
        let _guard = self.write.lock().await;
        self.ensure_conversation_locked(id, local, peer).await
    }

    async fn ensure_conversation_locked(
        &self,
        id: &str,
        x: &str,
        y: &str,
    ) -> Result<Conversation, StoreError> {
        let mut chats: Vec<Conversation> = self.load(CHATS_KEY).await?;
        if let Some(c) = chats.iter().find(|c| c.id == id) {
            return Ok(c.clone());
        }
        let conversation = Conversation::new(id.to_owned(), x, y);
        chats.push(conversation.clone());
        self.save(CHATS_KEY, &chats).await?;
        tracing::debug!(target: "pc_store", event = "conversation_created", conversation_id = %id);
        Ok(conversation)
    }

    pub async fn conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let chats: Vec<Conversation> = self.load(CHATS_KEY).await?;
        Ok(chats.into_iter().find(|c| c.id == id))
    }

    /// All conversations, most recent activity first.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut chats: Vec<Conversation> = self.load(CHATS_KEY).await?;
        chats.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at).then_with(|| a.id.cmp(&b.id)));
        Ok(chats)
    }

    pub async fn set_privacy(&self, id: &str, privacy: PrivacyFlags) -> Result<Conversation, StoreError> {
        let _guard = self.write.lock().await;
        let mut chats: Vec<Conversation> = self.load(CHATS_KEY).await?;
        let c = chats
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;
        c.privacy = privacy;
        let updated = c.clone();
        self.save(CHATS_KEY, &chats).await?;
        Ok(updated)
    }

    /// Caller holds the write lock.
    async fn touch_conversation(&self, message: &Message) -> Result<(), StoreError> {
        self.ensure_conversation_locked(&message.conversation_id, &message.sender_id, &message.recipient_id)
            .await?;
        let mut chats: Vec<Conversation> = self.load(CHATS_KEY).await?;
        if let Some(c) = chats.iter_mut().find(|c| c.id == message.conversation_id) {
            c.last_message_at = c.last_message_at.max(Some(message.created_at));
            if !message.is_outgoing && message.read_at.is_none() && !message.is_deleted {
                c.unread_count = c.unread_count.saturating_add(1);
            }
            self.save(CHATS_KEY, &chats).await?;
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Records that fail to parse are skipped, not fatal.
    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StoreError> {
        let raw = self.store.get_list(key).await?;
        Ok(raw
            .into_iter()
            .filter_map(|r| match serde_json::from_value(r) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(target: "pc_store", event = "record_skipped", key, error = %e);
                    None
                }
            })
            .collect())
    }

    async fn save<T: Serialize>(&self, key: &str, items: &[T]) -> Result<(), StoreError> {
        let records = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Record>, _>>()?;
        self.store.set_list(key, records).await
    }
}
