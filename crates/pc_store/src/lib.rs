//! pc_store: persistent records and the message repository
//!
//! # Layers
//! - `records`   : the generic list store interface (`RecordStore`) plus an
//!                  in-memory implementation
//! - `db`        : SQLite-backed `RecordStore`; each list is sealed with the
//!                  vault key (XChaCha20-Poly1305) before it touches disk
//! - `vault`     : in-memory key material unlocked by password or raw key
//! - `models`    : `Message` / `Conversation` records
//! - `repository`: the only writer of messages and conversations
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod db;
pub mod error;
pub mod models;
pub mod records;
pub mod repository;
pub mod vault;

pub use db::SqliteRecordStore;
pub use error::StoreError;
pub use models::{Conversation, Message, PrivacyFlags};
pub use records::{MemoryRecordStore, Record, RecordStore};
pub use repository::{MessageRepository, Upserted};
pub use vault::Vault;
