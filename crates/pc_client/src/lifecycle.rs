//! Connection lifecycle across foreground, background and termination.
//!
//! The coordinator is the only writer of the realtime slot and of the
//! connection state. Reconnects use bounded exponential backoff; once the
//! attempt cap is reached the UI gets a persistent `Offline` status and
//! nothing retries until the app returns to the foreground or the user
//! asks for `reconnect_now`.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Weak,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
};

use crate::{
    config::ClientConfig,
    events::{EventBus, InboundEvent, Via},
    handshake::HandshakeProtocol,
    transport::{ConnectionState, RealtimeChannel, RealtimeConnector, RealtimeEvent, RealtimeRelay},
    ui::{ConnectionStatus, UiEvent, UiHub},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
    Terminated,
}

#[derive(Default)]
struct Tasks {
    forwarder: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn reconnect_running(&self) -> bool {
        self.reconnect.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn abort_all(&mut self) {
        for handle in [self.forwarder.take(), self.keepalive.take(), self.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

pub struct LifecycleCoordinator {
    config: ClientConfig,
    connector: Arc<dyn RealtimeConnector>,
    realtime: Arc<RealtimeChannel>,
    inbound: EventBus<InboundEvent>,
    handshake: Arc<HandshakeProtocol>,
    ui: Arc<UiHub>,
    app_state: RwLock<AppState>,
    status: watch::Sender<ConnectionStatus>,
    attempts: AtomicU32,
    tasks: Mutex<Tasks>,
}

impl LifecycleCoordinator {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn RealtimeConnector>,
        realtime: Arc<RealtimeChannel>,
        inbound: EventBus<InboundEvent>,
        handshake: Arc<HandshakeProtocol>,
        ui: Arc<UiHub>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Offline);
        Arc::new(Self {
            config,
            connector,
            realtime,
            inbound,
            handshake,
            ui,
            app_state: RwLock::new(AppState::Foreground),
            status,
            attempts: AtomicU32::new(0),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    pub fn app_state(&self) -> AppState {
        *self.app_state.read()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.realtime.state()
    }

    /// Open the realtime connection and announce presence.
    pub async fn start(self: &Arc<Self>) {
        *self.app_state.write() = AppState::Foreground;
        tracing::info!(target: "pc_client", event = "lifecycle_start");
        self.connect_once().await;
        self.announce(true).await;
    }

    /// Keep the socket open so pushes still arrive, but appear offline and
    /// re-assert the connection periodically.
    pub async fn enter_background(self: &Arc<Self>) {
        if self.app_state() != AppState::Foreground {
            return;
        }
        *self.app_state.write() = AppState::Background;
        tracing::info!(target: "pc_client", event = "lifecycle_background");
        self.announce(false).await;

        let weak = Arc::downgrade(self);
        let every = self.config.keepalive_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { break };
                this.keepalive_tick().await;
            }
        });
        if let Some(old) = self.tasks.lock().keepalive.replace(handle) {
            old.abort();
        }
    }

    pub async fn enter_foreground(self: &Arc<Self>) {
        if self.app_state() != AppState::Background {
            return;
        }
        *self.app_state.write() = AppState::Foreground;
        tracing::info!(target: "pc_client", event = "lifecycle_foreground");
        if let Some(keepalive) = self.tasks.lock().keepalive.take() {
            keepalive.abort();
        }

        let torn_down = self.realtime.current().map_or(true, |relay| !relay.is_alive());
        if torn_down || self.realtime.state() != ConnectionState::Connected {
            self.reconnect_now().await;
        }
        self.announce(true).await;

        if let Err(err) = self.handshake.reconcile().await {
            tracing::warn!(target: "pc_client", event = "reconcile_failed", error = %err);
        }
    }

    /// Disconnect, go offline and release every timer.  Terminal.
    pub async fn terminate(self: &Arc<Self>) {
        if self.app_state() == AppState::Terminated {
            return;
        }
        *self.app_state.write() = AppState::Terminated;
        tracing::info!(target: "pc_client", event = "lifecycle_terminate");
        self.tasks.lock().abort_all();

        self.announce(false).await;
        if let Some(relay) = self.realtime.take() {
            relay.disconnect().await;
        }
        self.realtime.set_state(ConnectionState::Disconnected);
        self.set_status(ConnectionStatus::Offline);
        self.handshake.shutdown();
    }

    /// Drop any backoff in progress and try to connect right away.
    pub async fn reconnect_now(self: &Arc<Self>) {
        if self.app_state() == AppState::Terminated {
            return;
        }
        if let Some(pending) = self.tasks.lock().reconnect.take() {
            pending.abort();
        }
        self.attempts.store(0, Ordering::SeqCst);
        self.connect_once().await;
    }

    async fn keepalive_tick(self: &Arc<Self>) {
        let alive = self.realtime.current().is_some_and(|relay| relay.is_alive());
        if alive && self.realtime.state() == ConnectionState::Connected {
            return;
        }
        if self.tasks.lock().reconnect_running() {
            return;
        }
        tracing::debug!(target: "pc_client", event = "keepalive_reconnect");
        self.attempts.store(0, Ordering::SeqCst);
        self.connect_once().await;
    }

    /// One connection attempt; failure hands over to the backoff loop.
    async fn connect_once(self: &Arc<Self>) -> bool {
        let relay = self.ensure_relay();
        self.realtime.set_state(ConnectionState::Connecting);
        self.set_status(ConnectionStatus::Connecting);
        match relay.connect().await {
            Ok(()) => {
                self.on_connected();
                true
            }
            Err(reason) => {
                tracing::warn!(target: "pc_client", event = "realtime_connect_failed", reason = %reason);
                self.realtime.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
                false
            }
        }
    }

    fn on_connected(&self) {
        self.realtime.set_state(ConnectionState::Connected);
        self.attempts.store(0, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Online);
    }

    /// Reuse the installed relay unless it is missing or was torn down.
    fn ensure_relay(self: &Arc<Self>) -> Arc<dyn RealtimeRelay> {
        if let Some(relay) = self.realtime.current().filter(|r| r.is_alive()) {
            return relay;
        }
        let relay = self.connector.create();
        self.realtime.install(relay.clone());
        tracing::debug!(target: "pc_client", event = "realtime_created");

        let forwarder = self.spawn_forwarder(&relay);
        if let Some(old) = self.tasks.lock().forwarder.replace(forwarder) {
            old.abort();
        }
        relay
    }

    fn spawn_forwarder(self: &Arc<Self>, relay: &Arc<dyn RealtimeRelay>) -> JoinHandle<()> {
        let mut events = relay.events();
        let watched = Arc::downgrade(relay);
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "pc_client", event = "realtime_lagged", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(this) = weak.upgrade() else { break };
                match event {
                    RealtimeEvent::Notification(notification) => {
                        this.inbound.publish(InboundEvent { notification, via: Via::Realtime });
                    }
                    RealtimeEvent::Disconnected { reason } => {
                        let current = this.realtime.current();
                        let still_installed = match (current, watched.upgrade()) {
                            (Some(current), Some(ours)) => Arc::ptr_eq(&current, &ours),
                            _ => false,
                        };
                        if still_installed {
                            tracing::warn!(target: "pc_client", event = "realtime_dropped", reason = %reason);
                            this.realtime.set_state(ConnectionState::Disconnected);
                            this.schedule_reconnect();
                        }
                    }
                    RealtimeEvent::Error(err) => {
                        tracing::warn!(target: "pc_client", event = "realtime_error", error = %err);
                    }
                    RealtimeEvent::Connected => {}
                }
            }
        })
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.app_state() == AppState::Terminated {
            return;
        }
        let mut tasks = self.tasks.lock();
        if tasks.reconnect_running() {
            return;
        }
        let weak = Arc::downgrade(self);
        let policy = self.config.reconnect.clone();
        tasks.reconnect = Some(tokio::spawn(async move {
            loop {
                let Some(this) = weak.upgrade() else { break };
                let attempt = this.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > policy.max_attempts {
                    tracing::error!(target: "pc_client", event = "reconnect_gave_up", attempts = policy.max_attempts);
                    this.realtime.set_state(ConnectionState::Disconnected);
                    this.set_status(ConnectionStatus::Offline);
                    break;
                }
                this.realtime.set_state(ConnectionState::Reconnecting);
                this.set_status(ConnectionStatus::Reconnecting { attempt });
                let delay = policy.delay(attempt);
                tracing::info!(
                    target: "pc_client",
                    event = "reconnect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                drop(this);
                tokio::time::sleep(delay).await;

                let Some(this) = weak.upgrade() else { break };
                if this.app_state() == AppState::Terminated {
                    break;
                }
                let relay = this.ensure_relay();
                match relay.connect().await {
                    Ok(()) => {
                        this.on_connected();
                        tracing::info!(target: "pc_client", event = "reconnected", attempt);
                        if let Err(err) = this.handshake.reconcile().await {
                            tracing::warn!(target: "pc_client", event = "reconcile_failed", error = %err);
                        }
                        break;
                    }
                    Err(reason) => {
                        tracing::warn!(target: "pc_client", event = "reconnect_failed", attempt, reason = %reason);
                    }
                }
            }
        }));
    }

    async fn announce(&self, online: bool) {
        if let Err(err) = self.handshake.broadcast_presence(online).await {
            tracing::warn!(target: "pc_client", event = "presence_failed", online, error = %err);
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(target: "pc_client", event = "connection_status", status = ?status);
            self.ui.publish(UiEvent::Connection(status));
        }
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}
