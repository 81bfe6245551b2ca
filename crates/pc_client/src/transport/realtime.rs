//! Realtime channel: the process-wide slot holding the socket connection.
//!
//! Only the lifecycle coordinator installs, replaces or clears the relay
//! and moves the state. Everyone else borrows it and gets
//! `Rejected(Disconnected)` when it is not usable.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use pc_proto::Notification;

use super::{ConnectionState, RealtimeRelay, RejectReason, SendOutcome};

pub struct RealtimeChannel {
    slot: RwLock<Option<Arc<dyn RealtimeRelay>>>,
    state: watch::Sender<ConnectionState>,
}

impl Default for RealtimeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeChannel {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { slot: RwLock::new(None), state }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> Option<Arc<dyn RealtimeRelay>> {
        self.slot.read().clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    pub(crate) fn install(&self, relay: Arc<dyn RealtimeRelay>) {
        *self.slot.write() = Some(relay);
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn RealtimeRelay>> {
        self.slot.write().take()
    }

    pub async fn send(&self, peer_id: &str, notification: &Notification) -> SendOutcome {
        if self.state() != ConnectionState::Connected {
            return SendOutcome::Rejected(RejectReason::Disconnected);
        }
        match self.current() {
            Some(relay) => relay.emit(peer_id, notification).await,
            None => SendOutcome::Rejected(RejectReason::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use pc_proto::NotificationType;

    #[tokio::test]
    async fn empty_slot_is_disconnected() {
        let channel = RealtimeChannel::new();
        let n = Notification {
            kind: NotificationType::TypingIndicator,
            sender_id: "05a".into(),
            payload: String::new(),
            checksum: String::new(),
        };
        assert_eq!(
            channel.send("05b", &n).await,
            SendOutcome::Rejected(RejectReason::Disconnected)
        );

        let hub = MemoryHub::new();
        channel.install(Arc::new(hub.realtime("05a")));
        assert_eq!(
            channel.send("05b", &n).await,
            SendOutcome::Rejected(RejectReason::Disconnected),
            "installed but not connected"
        );
    }

    #[test]
    fn state_changes_are_observable() {
        let channel = RealtimeChannel::new();
        let rx = channel.subscribe_state();
        channel.set_state(ConnectionState::Connecting);
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
        assert!(channel.take().is_none());
    }
}
