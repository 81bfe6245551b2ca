//! Client configuration.
//!
//! Defaults are usable as-is; `from_env` overlays the `PC_*` variables and
//! `load` reads a JSON file (missing fields fall back to defaults).

use std::{path::Path, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use pc_proto::PaddingMode;

use crate::error::ChatError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the status goes `Offline`.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { max_attempts: 8, initial_backoff_ms: 1_000, max_backoff_ms: 60_000 }
    }
}

impl ReconnectPolicy {
    /// `min(initial * 2^(attempt-1), max)`, attempt is 1-based.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Base delay plus up to 20% random jitter, still capped at the maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 5);
        Duration::from_millis(base.saturating_add(jitter).min(self.max_backoff_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub push_relay_url: String,
    pub relay_token: Option<String>,
    /// Display name carried in outgoing envelopes.
    pub sender_name: String,
    pub send_timeout_secs: u64,
    pub reconnect: ReconnectPolicy,
    pub keepalive_interval_secs: u64,
    pub typing_expiry_ms: u64,
    /// Input idle time after which the sender emits `is_typing = false`.
    pub typing_idle_ms: u64,
    pub decrypt_attempts: u32,
    pub decrypt_retry_delay_ms: u64,
    pub padding: PaddingMode,
    /// Outbound messages still `Sent` after this long are re-sent on reconciliation.
    pub resend_after_secs: u64,
    pub inbox_poll_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            push_relay_url: "https://push.peerchat.local".into(),
            relay_token: None,
            sender_name: "anonymous".into(),
            send_timeout_secs: 15,
            reconnect: ReconnectPolicy::default(),
            keepalive_interval_secs: 30,
            typing_expiry_ms: 5_000,
            typing_idle_ms: 3_000,
            decrypt_attempts: 3,
            decrypt_retry_delay_ms: 200,
            padding: PaddingMode::Buckets,
            resend_after_secs: 60,
            inbox_poll_interval_secs: 10,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `PC_*` environment variables. Unparseable numbers are ignored.
    pub fn with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("PC_PUSH_RELAY_URL") {
            self.push_relay_url = url;
        }
        if let Ok(token) = std::env::var("PC_RELAY_TOKEN") {
            self.relay_token = Some(token);
        }
        if let Some(n) = env_number("PC_MAX_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = u32::try_from(n).unwrap_or(u32::MAX);
        }
        if let Some(n) = env_number("PC_SEND_TIMEOUT_SECS") {
            self.send_timeout_secs = n;
        }
        self
    }

    pub fn load(path: &Path) -> Result<Self, ChatError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| ChatError::Config(format!("{}: {e}", path.display())))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn decrypt_retry_delay(&self) -> Duration {
        Duration::from_millis(self.decrypt_retry_delay_ms)
    }

    pub fn resend_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.resend_after_secs as i64)
    }

    pub fn inbox_poll_interval(&self) -> Duration {
        Duration::from_secs(self.inbox_poll_interval_secs.max(1))
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
