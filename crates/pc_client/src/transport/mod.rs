//! Transport abstraction.
//!
//! Two channels carry the same opaque `Notification`:
//!   - `NotificationChannel`: fire-and-forget via a push relay. Carries
//!     messages and receipts so delivery never depends on the peer being
//!     connected.
//!   - `RealtimeChannel`: persistent socket, preferred for ephemeral
//!     signals (typing, presence).
//!
//! `Accepted` only means a relay took responsibility for a delivery
//! attempt. Receipts are the only proof the peer got anything.

pub mod http;
pub mod memory;
pub mod notification;
pub mod realtime;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::broadcast;

use pc_proto::{api::RelayQueued, Notification};

pub use notification::NotificationChannel;
pub use realtime::RealtimeChannel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Relay(String),
    Timeout,
    Disconnected,
    Unauthorized,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Relay(msg) => write!(f, "relay: {msg}"),
            RejectReason::Timeout => f.write_str("timeout"),
            RejectReason::Disconnected => f.write_str("disconnected"),
            RejectReason::Unauthorized => f.write_str("unauthorized"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::Accepted)
    }
}

/// Realtime connection state. Owned by the lifecycle coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// External push relay.
#[async_trait]
pub trait PushRelay: Send + Sync {
    async fn deliver(&self, recipient_id: &str, notification: &Notification) -> SendOutcome;

    /// Fetch notifications queued for the local user.
    async fn poll(&self) -> Result<Vec<RelayQueued>, RejectReason>;

    /// Tell the relay these queued notifications were received.
    async fn ack(&self, ids: &[String]) -> Result<(), RejectReason>;
}

/// Events raised by a realtime relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    Connected,
    Disconnected { reason: String },
    Error(String),
    Notification(Notification),
}

/// External realtime relay connection.
#[async_trait]
pub trait RealtimeRelay: Send + Sync {
    async fn connect(&self) -> Result<(), RejectReason>;
    async fn disconnect(&self);
    async fn emit(&self, recipient_id: &str, notification: &Notification) -> SendOutcome;
    fn events(&self) -> broadcast::Receiver<RealtimeEvent>;

    /// False once the underlying connection object was torn down (for
    /// example by the OS while backgrounded) and must be recreated.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Creates realtime connections. Only the lifecycle coordinator calls this.
pub trait RealtimeConnector: Send + Sync {
    fn create(&self) -> Arc<dyn RealtimeRelay>;
}

/// Picks a channel per notification type and bounds every send with a timeout.
pub struct TransportRouter {
    notification: Arc<NotificationChannel>,
    realtime: Arc<RealtimeChannel>,
    timeout: Duration,
}

impl TransportRouter {
    pub fn new(notification: Arc<NotificationChannel>, realtime: Arc<RealtimeChannel>, timeout: Duration) -> Self {
        Self { notification, realtime, timeout }
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    pub fn notification(&self) -> &Arc<NotificationChannel> {
        &self.notification
    }

    /// Messages and receipts go through the push relay. Typing and presence
    /// prefer the realtime socket and fall back to the push relay.
    pub async fn send(&self, peer_id: &str, notification: &Notification) -> SendOutcome {
        if notification.kind.is_ephemeral() && self.realtime.state() == ConnectionState::Connected {
            match self.bounded(self.realtime.send(peer_id, notification)).await {
                SendOutcome::Accepted => return SendOutcome::Accepted,
                SendOutcome::Rejected(reason) => {
                    tracing::debug!(
                        target: "pc_client",
                        event = "realtime_fallback",
                        kind = notification.kind.as_str(),
                        reason = %reason
                    );
                }
            }
        }
        self.bounded(self.notification.send(peer_id, notification)).await
    }

    async fn bounded<F>(&self, fut: F) -> SendOutcome
    where
        F: std::future::Future<Output = SendOutcome>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::Rejected(RejectReason::Timeout),
        }
    }
}
