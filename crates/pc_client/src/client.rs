//! `ChatClient`: wires keys, storage, transports, handshake and lifecycle
//! together for one local identity.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{
    sync::broadcast::error::{RecvError, TryRecvError},
    task::JoinHandle,
};

use pc_crypto::{IdentityKeyPair, SessionId};
use pc_proto::HandshakeStage;
use pc_store::{Conversation, Message, MessageRepository, PrivacyFlags, RecordStore};

use crate::{
    config::ClientConfig,
    error::ChatError,
    events::{EventBus, EventReceiver, InboundEvent, Via},
    handshake::{HandshakeProtocol, ReconcileReport},
    keys::{normalize_peer_id, KeyStore, LocalKeyStore},
    lifecycle::LifecycleCoordinator,
    transport::{
        http::HttpPushRelay, NotificationChannel, PushRelay, RealtimeChannel, RealtimeConnector, TransportRouter,
    },
    ui::{UiEvent, UiHub},
};

pub struct ChatClient {
    keys: Arc<LocalKeyStore>,
    repo: Arc<MessageRepository>,
    router: Arc<TransportRouter>,
    handshake: Arc<HandshakeProtocol>,
    lifecycle: Arc<LifecycleCoordinator>,
    ui: Arc<UiHub>,
    inbound_rx: tokio::sync::Mutex<EventReceiver<InboundEvent>>,
    inbox: tokio::sync::Mutex<()>,
    poll_every: std::time::Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(
        config: ClientConfig,
        identity: IdentityKeyPair,
        store: Arc<dyn RecordStore>,
        push: Arc<dyn PushRelay>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Result<Self, ChatError> {
        let keys = Arc::new(LocalKeyStore::new(identity)?);
        let repo = Arc::new(MessageRepository::new(store));
        let ui = Arc::new(UiHub::new());

        let inbound: EventBus<InboundEvent> = EventBus::new(256);
        let inbound_rx = inbound.subscribe();
        let notification = Arc::new(NotificationChannel::new(push));
        let realtime = Arc::new(RealtimeChannel::new());
        let router = Arc::new(TransportRouter::new(notification, realtime.clone(), config.send_timeout()));

        let handshake = Arc::new(HandshakeProtocol::new(
            config.clone(),
            keys.clone(),
            repo.clone(),
            router.clone(),
            ui.clone(),
        ));
        let poll_every = config.inbox_poll_interval();
        let lifecycle = LifecycleCoordinator::new(config, connector, realtime, inbound, handshake.clone(), ui.clone());

        tracing::info!(
            target: "pc_client",
            event = "client_created",
            session_id = %keys.current_session_id(),
            fingerprint = %keys.fingerprint()
        );
        Ok(Self {
            keys,
            repo,
            router,
            handshake,
            lifecycle,
            ui,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            inbox: tokio::sync::Mutex::new(()),
            poll_every,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Client whose push relay is the HTTP relay named by `push_relay_url`.
    pub fn with_http_relay(
        config: ClientConfig,
        identity: IdentityKeyPair,
        store: Arc<dyn RecordStore>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Result<Self, ChatError> {
        let push = HttpPushRelay::from_config(&config).map_err(|reason| ChatError::Config(reason.to_string()))?;
        tracing::info!(target: "pc_client", event = "push_relay_configured", url = %config.push_relay_url);
        Self::new(config, identity, store, Arc::new(push), connector)
    }

    pub fn session_id(&self) -> &str {
        self.keys.current_session_id().as_str()
    }

    pub fn keys(&self) -> &Arc<LocalKeyStore> {
        &self.keys
    }

    pub fn repository(&self) -> &Arc<MessageRepository> {
        &self.repo
    }

    pub fn handshake(&self) -> &Arc<HandshakeProtocol> {
        &self.handshake
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleCoordinator> {
        &self.lifecycle
    }

    pub fn ui(&self) -> &Arc<UiHub> {
        &self.ui
    }

    pub fn subscribe_ui(&self) -> EventReceiver<UiEvent> {
        self.ui.subscribe()
    }

    pub fn add_contact(&self, session_id: &str) -> Result<SessionId, ChatError> {
        Ok(self.keys.add_contact(session_id)?)
    }

    /// Connect the realtime channel and start the typing sender.
    pub async fn start(&self) {
        self.lifecycle.start().await;
        if let Some(handle) = self.handshake.spawn_typing_sender() {
            self.tasks.lock().push(handle);
        }
    }

    /// Handle everything queued at the push relay, then every realtime event
    /// received so far.  Returns how many were handled.  When the background
    /// event loop is running, realtime events are left to it.
    pub async fn pump(&self) -> Result<usize, ChatError> {
        let mut handled = self.drain_inbox().await?;
        let Ok(mut rx) = self.inbound_rx.try_lock() else {
            return Ok(handled);
        };
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    self.handshake.handle_inbound(&event).await?;
                    handled += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "pc_client", event = "inbound_lagged", skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        Ok(handled)
    }

    /// One pass over the push relay inbox.  An item is acked only once the
    /// handshake has stored and acknowledged it; the first failure stops the
    /// pass and leaves the rest queued for the next poll.
    async fn drain_inbox(&self) -> Result<usize, ChatError> {
        let _serial = self.inbox.lock().await;
        let channel = self.router.notification();
        let queued = match channel.fetch().await {
            Ok(queued) => queued,
            Err(reason) => {
                tracing::warn!(target: "pc_client", event = "poll_failed", reason = %reason);
                return Ok(0);
            }
        };

        let mut done = Vec::with_capacity(queued.len());
        let mut failure = None;
        for item in queued {
            let event = InboundEvent { notification: item.notification, via: Via::Notification };
            match self.handshake.handle_inbound(&event).await {
                Ok(()) => done.push(item.id),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        channel.ack(&done).await;
        match failure {
            Some(err) => Err(err),
            None => Ok(done.len()),
        }
    }

    /// Poll the push relay periodically and handle realtime events as they
    /// arrive, until `shutdown`.
    pub fn spawn_background(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let every = self.poll_every;
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else { break };
                if let Err(err) = client.drain_inbox().await {
                    tracing::error!(target: "pc_client", event = "inbox_failed", error = %err);
                }
            }
        });

        let client = self.clone();
        let handler = tokio::spawn(async move {
            let mut rx = client.inbound_rx.lock().await;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(err) = client.handshake.handle_inbound(&event).await {
                            tracing::error!(target: "pc_client", event = "inbound_failed", error = %err);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "pc_client", event = "inbound_lagged", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().extend([poller, handler]);
    }

    pub async fn send_message(&self, peer_id: &str, text: &str) -> Result<Message, ChatError> {
        self.handshake.send_message(peer_id, text).await
    }

    pub async fn resend(&self, message_id: &str) -> Result<Message, ChatError> {
        self.handshake.resend(message_id).await
    }

    /// Put the conversation with `peer_id` on screen and consume it.
    pub async fn open_conversation(&self, peer_id: &str) -> Result<Vec<String>, ChatError> {
        self.ui.set_active_conversation(Some(self.handshake.conversation_with(peer_id)));
        self.handshake.mark_conversation_read(peer_id).await
    }

    pub fn close_conversation(&self) {
        self.ui.set_active_conversation(None);
    }

    pub async fn mark_conversation_read(&self, peer_id: &str) -> Result<Vec<String>, ChatError> {
        self.handshake.mark_conversation_read(peer_id).await
    }

    pub async fn input_changed(&self, peer_id: &str) -> Result<(), ChatError> {
        self.handshake.input_changed(peer_id).await
    }

    pub fn input_cleared(&self, peer_id: &str) {
        self.handshake.input_cleared(peer_id);
    }

    pub async fn messages_with(&self, peer_id: &str) -> Result<Vec<Message>, ChatError> {
        self.handshake.messages_with(peer_id).await
    }

    pub async fn message(&self, message_id: &str) -> Result<Option<Message>, ChatError> {
        Ok(self.repo.get_message(message_id).await?)
    }

    pub async fn stage(&self, message_id: &str) -> Result<Option<HandshakeStage>, ChatError> {
        self.handshake.stage(message_id).await
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        Ok(self.repo.list_conversations().await?)
    }

    pub async fn set_privacy(&self, peer_id: &str, privacy: PrivacyFlags) -> Result<Conversation, ChatError> {
        let peer_id: &str = &normalize_peer_id(peer_id);
        let conversation_id = self.handshake.conversation_with(peer_id);
        self.repo.ensure_conversation(&conversation_id, self.session_id(), peer_id).await?;
        Ok(self.repo.set_privacy(&conversation_id, privacy).await?)
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, ChatError> {
        self.handshake.reconcile().await
    }

    pub async fn enter_background(&self) {
        self.lifecycle.enter_background().await;
    }

    pub async fn enter_foreground(&self) {
        self.lifecycle.enter_foreground().await;
    }

    pub async fn reconnect_now(&self) {
        self.lifecycle.reconnect_now().await;
    }

    /// Terminate the lifecycle and stop every background task.
    pub async fn shutdown(&self) {
        self.lifecycle.terminate().await;
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
