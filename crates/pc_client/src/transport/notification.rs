//! Push-relay channel.

use std::sync::Arc;

use pc_proto::{api::RelayQueued, Notification};

use super::{PushRelay, RejectReason, SendOutcome};

pub struct NotificationChannel {
    relay: Arc<dyn PushRelay>,
}

impl NotificationChannel {
    pub fn new(relay: Arc<dyn PushRelay>) -> Self {
        Self { relay }
    }

    pub async fn send(&self, peer_id: &str, notification: &Notification) -> SendOutcome {
        let outcome = self.relay.deliver(peer_id, notification).await;
        if let SendOutcome::Rejected(reason) = &outcome {
            tracing::warn!(
                target: "pc_client",
                event = "push_send_rejected",
                kind = notification.kind.as_str(),
                peer_id = %peer_id,
                reason = %reason
            );
        }
        outcome
    }

    /// Fetch queued notifications. Nothing is acked here: the relay keeps
    /// each item until `ack` is called for it.
    pub async fn fetch(&self) -> Result<Vec<RelayQueued>, RejectReason> {
        let queued = self.relay.poll().await?;
        if !queued.is_empty() {
            tracing::debug!(target: "pc_client", event = "poll_inbox", count = queued.len());
        }
        Ok(queued)
    }

    /// Ack handled items. On failure they are redelivered by the next poll.
    pub async fn ack(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        if let Err(reason) = self.relay.ack(ids).await {
            tracing::warn!(target: "pc_client", event = "poll_ack_failed", count = ids.len(), reason = %reason);
        }
    }
}
