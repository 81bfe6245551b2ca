//! Push relay request/response types.
//! These map directly to JSON bodies on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{Notification, NotificationType};

#[derive(Debug, Serialize, Deserialize)]
pub struct RelaySendRequest {
    pub recipient_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub payload: String,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelaySendResponse {
    pub delivery_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// One queued notification as returned by `/poll`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RelayQueued {
    /// Relay-side ID, used only for acking.
    pub id: String,
    #[serde(flatten)]
    pub notification: Notification,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayPollResponse {
    pub notifications: Vec<RelayQueued>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayAckRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
