//! In-process loopback relay for tests and the demo.
//!
//! One `MemoryHub` plays both relays for any number of clients. Faults can
//! be injected per notification type: reject, silently drop, duplicate, or
//! stall until the caller's timeout fires.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use pc_proto::{api::RelayQueued, Notification, NotificationType};

use super::{PushRelay, RealtimeConnector, RealtimeEvent, RealtimeRelay, RejectReason, SendOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Refuse the notification.
    Reject,
    /// Accept, then lose it.
    Drop,
    /// Accept and deliver it twice.
    Duplicate,
    /// Never answer.
    Stall,
}

struct Rule {
    kind: Option<NotificationType>,
    fault: Fault,
    remaining: Option<u32>,
}

struct RealtimePeer {
    events: broadcast::Sender<RealtimeEvent>,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct HubState {
    queues: HashMap<String, VecDeque<RelayQueued>>,
    rules: Vec<Rule>,
    realtime: HashMap<String, RealtimePeer>,
    realtime_down: bool,
    accepted: HashMap<NotificationType, u32>,
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `fault` to every notification from now on.
    pub fn set_fault(&self, fault: Fault) {
        let mut state = self.state.lock();
        state.rules.clear();
        state.rules.push(Rule { kind: None, fault, remaining: None });
    }

    /// Apply `fault` to the next `times` notifications of `kind`.
    pub fn fault_next(&self, kind: NotificationType, fault: Fault, times: u32) {
        self.state.lock().rules.push(Rule { kind: Some(kind), fault, remaining: Some(times) });
    }

    pub fn clear_faults(&self) {
        self.state.lock().rules.clear();
    }

    /// Make realtime `connect` calls fail (server unreachable).
    pub fn set_realtime_down(&self, down: bool) {
        self.state.lock().realtime_down = down;
    }

    /// Server-side drop of `owner`'s realtime connection.
    pub fn drop_realtime(&self, owner: &str) {
        let state = self.state.lock();
        if let Some(peer) = state.realtime.get(owner) {
            if peer.connected.swap(false, Ordering::SeqCst) {
                let _ = peer.events.send(RealtimeEvent::Disconnected { reason: "server closed".into() });
            }
        }
    }

    pub fn queued_for(&self, recipient: &str) -> usize {
        self.state.lock().queues.get(recipient).map_or(0, VecDeque::len)
    }

    /// Notifications of `kind` the push relay accepted so far.
    pub fn accepted(&self, kind: NotificationType) -> u32 {
        self.state.lock().accepted.get(&kind).copied().unwrap_or(0)
    }

    pub fn push_relay(&self, owner: &str) -> MemoryPushRelay {
        MemoryPushRelay { hub: self.clone(), owner: owner.to_owned() }
    }

    pub fn realtime(&self, owner: &str) -> MemoryRealtime {
        let (events, _) = broadcast::channel(64);
        let connected = Arc::new(AtomicBool::new(false));
        self.state.lock().realtime.insert(
            owner.to_owned(),
            RealtimePeer { events: events.clone(), connected: connected.clone() },
        );
        MemoryRealtime {
            hub: self.clone(),
            owner: owner.to_owned(),
            events,
            connected,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn connector(&self, owner: &str) -> MemoryConnector {
        MemoryConnector { hub: self.clone(), owner: owner.to_owned(), last: Mutex::new(None) }
    }

    fn take_fault(&self, kind: NotificationType) -> Option<Fault> {
        let mut state = self.state.lock();
        let idx = state
            .rules
            .iter()
            .position(|r| r.kind.map_or(true, |k| k == kind) && r.remaining != Some(0))?;
        let rule = &mut state.rules[idx];
        let fault = rule.fault;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault)
    }

    fn enqueue(&self, recipient: &str, notification: &Notification, copies: usize) {
        let mut state = self.state.lock();
        *state.accepted.entry(notification.kind).or_default() += 1;
        let queue = state.queues.entry(recipient.to_owned()).or_default();
        for _ in 0..copies {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            queue.push_back(RelayQueued { id: format!("q{id}"), notification: notification.clone() });
        }
    }
}

pub struct MemoryPushRelay {
    hub: MemoryHub,
    owner: String,
}

#[async_trait]
impl PushRelay for MemoryPushRelay {
    async fn deliver(&self, recipient_id: &str, notification: &Notification) -> SendOutcome {
        match self.hub.take_fault(notification.kind) {
            Some(Fault::Reject) => SendOutcome::Rejected(RejectReason::Relay("rejected by test relay".into())),
            Some(Fault::Stall) => std::future::pending().await,
            Some(Fault::Drop) => {
                *self.hub.state.lock().accepted.entry(notification.kind).or_default() += 1;
                SendOutcome::Accepted
            }
            Some(Fault::Duplicate) => {
                self.hub.enqueue(recipient_id, notification, 2);
                SendOutcome::Accepted
            }
            None => {
                self.hub.enqueue(recipient_id, notification, 1);
                SendOutcome::Accepted
            }
        }
    }

    async fn poll(&self) -> Result<Vec<RelayQueued>, RejectReason> {
        let state = self.hub.state.lock();
        Ok(state
            .queues
            .get(&self.owner)
            .map(|q| q.iter().map(|item| RelayQueued { id: item.id.clone(), notification: item.notification.clone() }).collect())
            .unwrap_or_default())
    }

    async fn ack(&self, ids: &[String]) -> Result<(), RejectReason> {
        let mut state = self.hub.state.lock();
        if let Some(queue) = state.queues.get_mut(&self.owner) {
            queue.retain(|item| !ids.contains(&item.id));
        }
        Ok(())
    }
}

pub struct MemoryRealtime {
    hub: MemoryHub,
    owner: String,
    events: broadcast::Sender<RealtimeEvent>,
    connected: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl MemoryRealtime {
    /// Simulate the OS tearing the socket object down.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RealtimeRelay for MemoryRealtime {
    async fn connect(&self) -> Result<(), RejectReason> {
        if self.hub.state.lock().realtime_down || !self.alive.load(Ordering::SeqCst) {
            return Err(RejectReason::Disconnected);
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(RealtimeEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn emit(&self, recipient_id: &str, notification: &Notification) -> SendOutcome {
        if !self.connected.load(Ordering::SeqCst) {
            return SendOutcome::Rejected(RejectReason::Disconnected);
        }
        match self.hub.take_fault(notification.kind) {
            Some(Fault::Reject) => return SendOutcome::Rejected(RejectReason::Relay("rejected by test relay".into())),
            Some(Fault::Stall) => return std::future::pending().await,
            Some(Fault::Drop) => return SendOutcome::Accepted,
            Some(Fault::Duplicate) | None => {}
        }
        let state = self.hub.state.lock();
        match state.realtime.get(recipient_id) {
            Some(peer) if peer.connected.load(Ordering::SeqCst) => {
                let _ = peer.events.send(RealtimeEvent::Notification(notification.clone()));
                SendOutcome::Accepted
            }
            _ => SendOutcome::Rejected(RejectReason::Relay(format!("{recipient_id} not connected"))),
        }
    }

    fn events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryRealtime {
    fn drop(&mut self) {
        let mut state = self.hub.state.lock();
        let ours = state
            .realtime
            .get(&self.owner)
            .map_or(false, |peer| Arc::ptr_eq(&peer.connected, &self.connected));
        if ours {
            state.realtime.remove(&self.owner);
        }
    }
}

/// Hands out fresh `MemoryRealtime` connections and remembers the latest
/// one so tests can kill it.
pub struct MemoryConnector {
    hub: MemoryHub,
    owner: String,
    last: Mutex<Option<Arc<MemoryRealtime>>>,
}

impl MemoryConnector {
    pub fn last(&self) -> Option<Arc<MemoryRealtime>> {
        self.last.lock().clone()
    }
}

impl RealtimeConnector for MemoryConnector {
    fn create(&self) -> Arc<dyn RealtimeRelay> {
        let relay = Arc::new(self.hub.realtime(&self.owner));
        *self.last.lock() = Some(relay.clone());
        relay
    }
}
