//! Typed broadcast buses.
//!
//! Every consumer (handshake, UI, tests) subscribes independently; a slow
//! subscriber lags and drops old events without blocking publishers.

use tokio::sync::broadcast;

use pc_proto::Notification;

pub type EventReceiver<T> = broadcast::Receiver<T>;

#[derive(Clone)]
pub struct EventBus<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver<T> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }
}

/// Which transport delivered an inbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Realtime,
    Notification,
}

/// One opaque notification received from a relay, not yet decrypted.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub notification: Notification,
    pub via: Via,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus: EventBus<u32> = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(7);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus: EventBus<u32> = EventBus::new(1);
        bus.publish(1);
        bus.publish(2);
    }
}
