//! One-shot delivery over HTTP.
//!
//! For environments without sockets. Each message is POSTed as JSON to the
//! room's `http_url` and the reply, if any, comes back in the response body:
//! a push answers `null`, a `get` answers with its `init`.

use reqwest::Client;
use tracing::{debug, warn};

use driftline_core::{CoreError, MessageFromDb, MessageToDb, RoomInfo};

use crate::error::{NetError, Result};

/// Sends single messages to a room's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpConnection {
    client: Client,
    http_url: String,
}

impl HttpConnection {
    pub fn new(http_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            http_url: http_url.into(),
        }
    }

    /// Target the HTTP endpoint of a room record.
    pub fn from_room(room: &RoomInfo) -> Self {
        Self::new(room.http_url.clone())
    }

    pub fn http_url(&self) -> &str {
        &self.http_url
    }

    /// POST one message and return the server's reply.
    pub async fn send(&self, message: &MessageToDb) -> Result<Option<MessageFromDb>> {
        let response = self
            .client
            .post(&self.http_url)
            .json(message)
            .send()
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.http_url, %status, "http send rejected");
            return Err(NetError::Http {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let reply: Option<MessageFromDb> = response
            .json()
            .await
            .map_err(|e| NetError::Codec(CoreError::DecodingError(e.to_string())))?;
        debug!(
            url = %self.http_url,
            key = ?message.key(),
            replied = reply.is_some(),
            "http send"
        );
        Ok(reply)
    }
}
