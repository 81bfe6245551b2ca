//! HTTP push relay client (reqwest).
//!
//!   POST {base}/send  {recipient_id, type, payload, checksum}
//!   POST {base}/poll  {}            → {notifications: [...]}
//!   POST {base}/ack   {ids: [...]}

use async_trait::async_trait;
use reqwest::StatusCode;

use pc_proto::{
    api::{ErrorResponse, RelayAckRequest, RelayPollResponse, RelayQueued, RelaySendRequest},
    Notification,
};

use crate::config::ClientConfig;

use super::{PushRelay, RejectReason, SendOutcome};

pub struct HttpPushRelay {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPushRelay {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, RejectReason> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RejectReason::Relay(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_owned(), token })
    }

    /// Relay at `push_relay_url`, authenticated with `relay_token` when set.
    pub fn from_config(config: &ClientConfig) -> Result<Self, RejectReason> {
        Self::new(config.push_relay_url.clone(), config.relay_token.clone())
    }

    async fn post<B: serde::Serialize + Sync>(&self, path: &str, body: &B) -> Result<reqwest::Response, RejectReason> {
        let mut req = self.client.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RejectReason::Timeout
            } else {
                RejectReason::Relay(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(target: "pc_client", event = "relay_unauthorized", path);
            return Err(RejectReason::Unauthorized);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| format!("{} ({})", e.error, e.code))
                .unwrap_or_else(|_| format!("status {status}"));
            tracing::error!(
                target: "pc_client",
                event = "relay_request_failed",
                path,
                status = %status,
                body_len = body.len()
            );
            return Err(RejectReason::Relay(detail));
        }
        Ok(resp)
    }
}

#[async_trait]
impl PushRelay for HttpPushRelay {
    async fn deliver(&self, recipient_id: &str, notification: &Notification) -> SendOutcome {
        let body = RelaySendRequest {
            recipient_id: recipient_id.to_owned(),
            kind: notification.kind,
            payload: notification.payload.clone(),
            checksum: notification.checksum.clone(),
        };
        match self.post("/send", &body).await {
            Ok(_) => {
                tracing::debug!(
                    target: "pc_client",
                    event = "relay_send_ok",
                    kind = notification.kind.as_str(),
                    recipient_id = %recipient_id
                );
                SendOutcome::Accepted
            }
            Err(reason) => SendOutcome::Rejected(reason),
        }
    }

    async fn poll(&self) -> Result<Vec<RelayQueued>, RejectReason> {
        let resp = self.post("/poll", &serde_json::json!({})).await?;
        let poll: RelayPollResponse = resp
            .json()
            .await
            .map_err(|e| RejectReason::Relay(format!("bad poll response: {e}")))?;
        Ok(poll.notifications)
    }

    async fn ack(&self, ids: &[String]) -> Result<(), RejectReason> {
        self.post("/ack", &RelayAckRequest { ids: ids.to_vec() }).await.map(|_| ())
    }
}
