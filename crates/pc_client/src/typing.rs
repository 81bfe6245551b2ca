//! Typing indicators.
//!
//! Receiver side: `TypingTracker` keeps a self-expiring flag per peer. Every
//! signal cancels and replaces the peer's pending expiry timer.
//!
//! Sender side: `TypingDebouncer` turns raw input events into
//! `is_typing` transitions. It emits `true` on the first keystroke (and
//! again every `idle` while input continues, so the peer's expiry timer is
//! refreshed) and `false` once input stops for `idle` or is cleared.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::ui::{UiEvent, UiHub};

struct PeerTyping {
    generation: u64,
    timer: JoinHandle<()>,
}

pub struct TypingTracker {
    expiry: Duration,
    ui: Arc<UiHub>,
    active: Arc<Mutex<HashMap<String, PeerTyping>>>,
    last_signal: Mutex<HashMap<String, DateTime<Utc>>>,
    generation: AtomicU64,
}

impl TypingTracker {
    pub fn new(expiry: Duration, ui: Arc<UiHub>) -> Self {
        Self {
            expiry,
            ui,
            active: Arc::new(Mutex::new(HashMap::new())),
            last_signal: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Apply an inbound signal. Signals older than the last one seen from
    /// the same peer are ignored.
    pub fn apply(&self, peer_id: &str, is_typing: bool, sent_at: DateTime<Utc>) {
        {
            let mut last = self.last_signal.lock();
            match last.get(peer_id) {
                Some(prev) if *prev > sent_at => return,
                _ => {
                    last.insert(peer_id.to_owned(), sent_at);
                }
            }
        }

        let mut active = self.active.lock();
        let was_typing = match active.remove(peer_id) {
            Some(prev) => {
                prev.timer.abort();
                true
            }
            None => false,
        };

        if is_typing {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let timer = self.spawn_expiry(peer_id.to_owned(), generation);
            active.insert(peer_id.to_owned(), PeerTyping { generation, timer });
        }
        drop(active);

        if was_typing != is_typing {
            self.ui.publish(UiEvent::Typing { peer_id: peer_id.to_owned(), is_typing });
        }
    }

    fn spawn_expiry(&self, peer_id: String, generation: u64) -> JoinHandle<()> {
        let active = self.active.clone();
        let ui = self.ui.clone();
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let expired = {
                let mut active = active.lock();
                match active.get(&peer_id) {
                    Some(entry) if entry.generation == generation => {
                        active.remove(&peer_id);
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                tracing::debug!(target: "pc_client", event = "typing_expired", peer_id = %peer_id);
                ui.publish(UiEvent::Typing { peer_id, is_typing: false });
            }
        })
    }

    pub fn is_typing(&self, peer_id: &str) -> bool {
        self.active.lock().contains_key(peer_id)
    }

    /// Cancel every pending timer.
    pub fn clear(&self) {
        for (_, entry) in self.active.lock().drain() {
            entry.timer.abort();
        }
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A local `is_typing` transition to be sent to `peer_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingTransition {
    pub peer_id: String,
    pub is_typing: bool,
}

struct LocalTyping {
    generation: u64,
    last_emitted: Instant,
    idle_timer: JoinHandle<()>,
}

pub struct TypingDebouncer {
    idle: Duration,
    state: Arc<Mutex<HashMap<String, LocalTyping>>>,
    generation: AtomicU64,
    out: mpsc::UnboundedSender<TypingTransition>,
}

impl TypingDebouncer {
    pub fn new(idle: Duration) -> (Self, mpsc::UnboundedReceiver<TypingTransition>) {
        let (out, rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            idle,
            state: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            out,
        };
        (debouncer, rx)
    }

    pub fn input_changed(&self, peer_id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let last_emitted = match state.remove(peer_id) {
            Some(prev) => {
                prev.idle_timer.abort();
                if now.duration_since(prev.last_emitted) >= self.idle {
                    self.emit(peer_id, true);
                    now
                } else {
                    prev.last_emitted
                }
            }
            None => {
                self.emit(peer_id, true);
                now
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let idle_timer = self.spawn_idle(peer_id.to_owned(), generation);
        state.insert(peer_id.to_owned(), LocalTyping { generation, last_emitted, idle_timer });
    }

    pub fn input_cleared(&self, peer_id: &str) {
        let prev = self.state.lock().remove(peer_id);
        if let Some(prev) = prev {
            prev.idle_timer.abort();
            self.emit(peer_id, false);
        }
    }

    pub fn is_typing(&self, peer_id: &str) -> bool {
        self.state.lock().contains_key(peer_id)
    }

    /// Drop all local typing state without emitting anything.
    pub fn clear(&self) {
        for (_, entry) in self.state.lock().drain() {
            entry.idle_timer.abort();
        }
    }

    fn emit(&self, peer_id: &str, is_typing: bool) {
        let _ = self.out.send(TypingTransition { peer_id: peer_id.to_owned(), is_typing });
    }

    fn spawn_idle(&self, peer_id: String, generation: u64) -> JoinHandle<()> {
        let state = self.state.clone();
        let out = self.out.clone();
        let idle = self.idle;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let went_idle = {
                let mut state = state.lock();
                match state.get(&peer_id) {
                    Some(entry) if entry.generation == generation => {
                        state.remove(&peer_id);
                        true
                    }
                    _ => false,
                }
            };
            if went_idle {
                let _ = out.send(TypingTransition { peer_id, is_typing: false });
            }
        })
    }
}

impl Drop for TypingDebouncer {
    fn drop(&mut self) {
        self.clear();
    }
}
