//! pc_client: message delivery and acknowledgment for the peer chat client
//!
//! # Layers
//! - `keys`      : local identity and peer public keys
//! - `codec`     : seal/open notifications with integrity checks
//! - `transport` : push relay and realtime channels behind one router
//! - `handshake` : send → delivered → read, typing, presence, reconciliation
//! - `lifecycle` : foreground/background/terminated connection management
//! - `ui`        : events and status mapping for the UI layer
//! - `client`    : `ChatClient`, the facade tying it all together

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod keys;
pub mod lifecycle;
pub mod transport;
pub mod typing;
pub mod ui;

pub use client::ChatClient;
pub use codec::{EncryptionCodec, InboundBody};
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::{ChatError, ErrorKind, KeyError};
pub use events::{EventBus, EventReceiver, InboundEvent, Via};
pub use handshake::{HandshakeProtocol, PendingAck, PendingAction, ReconcileReport};
pub use keys::{KeyStore, LocalKeyStore};
pub use lifecycle::{AppState, LifecycleCoordinator};
pub use transport::{
    http::HttpPushRelay,
    memory::{Fault, MemoryConnector, MemoryHub},
    ConnectionState, PushRelay, RealtimeConnector, RealtimeEvent, RealtimeRelay, RejectReason, SendOutcome,
    TransportRouter,
};
pub use ui::{ConnectionStatus, StatusIcon, UiEvent, UiHub};
