//! Surface exposed to the UI layer: events, status icons, banners.

use parking_lot::RwLock;

use pc_proto::MessageStatus;

use crate::{
    error::{ChatError, ErrorKind},
    events::{EventBus, EventReceiver},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusIcon {
    Error,
    /// Clock.
    Pending,
    SingleTick,
    DoubleTick,
    DoubleBlueTick,
}

impl From<MessageStatus> for StatusIcon {
    fn from(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Error => StatusIcon::Error,
            MessageStatus::Composed => StatusIcon::Pending,
            MessageStatus::Sent => StatusIcon::SingleTick,
            MessageStatus::Delivered => StatusIcon::DoubleTick,
            MessageStatus::Read => StatusIcon::DoubleBlueTick,
        }
    }
}

/// Connection status as shown in the banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Connecting,
    Reconnecting { attempt: u32 },
    /// Reconnect cap reached. Stays until foreground or a manual reconnect.
    Offline,
}

impl ConnectionStatus {
    /// Banner text and colour.
    pub fn banner(&self) -> (String, &'static str) {
        match self {
            ConnectionStatus::Online => ("Connected".into(), "green"),
            ConnectionStatus::Connecting => ("Connecting...".into(), "orange"),
            ConnectionStatus::Reconnecting { attempt } => {
                (format!("Reconnecting (attempt {attempt})..."), "orange")
            }
            ConnectionStatus::Offline => ("Disconnected. Tap to retry.".into(), "red"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    ConversationChanged { conversation_id: String },
    MessageStatusChanged {
        conversation_id: String,
        message_id: String,
        status: MessageStatus,
        icon: StatusIcon,
    },
    Typing { peer_id: String, is_typing: bool },
    Presence { peer_id: String, online: bool },
    Connection(ConnectionStatus),
    Warning { conversation_id: String, kind: ErrorKind, text: String },
    KeyExchangeRequested { peer_id: String },
}

/// UI event bus plus the conversation currently on screen.
pub struct UiHub {
    bus: EventBus<UiEvent>,
    active: RwLock<Option<String>>,
}

impl Default for UiHub {
    fn default() -> Self {
        Self::new()
    }
}

impl UiHub {
    pub fn new() -> Self {
        Self { bus: EventBus::new(256), active: RwLock::new(None) }
    }

    pub fn subscribe(&self) -> EventReceiver<UiEvent> {
        self.bus.subscribe()
    }

    pub fn publish(&self, event: UiEvent) {
        self.bus.publish(event);
    }

    pub fn set_active_conversation(&self, conversation_id: Option<String>) {
        *self.active.write() = conversation_id;
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.read().as_deref() == Some(conversation_id)
    }

    /// Dismissible warning, only shown for the conversation on screen.
    pub fn warn(&self, conversation_id: &str, err: &ChatError) {
        if self.is_active(conversation_id) {
            self.publish(UiEvent::Warning {
                conversation_id: conversation_id.to_owned(),
                kind: err.kind(),
                text: err.to_string(),
            });
        }
    }
}
