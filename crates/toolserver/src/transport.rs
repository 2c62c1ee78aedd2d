//! HTTP transport for tool servers.
//!
//! Each JSON-RPC exchange is a single POST to the server's endpoint. The
//! transport owns reconnectable-error classification: transport failures
//! whose text matches a known set are worth a reconnect-and-retry cycle,
//! everything else is permanent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;

use crate::protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("status {0}: {1}")]
    Status(u16, String),

    #[error("{0}")]
    Rpc(#[from] JsonRpcError),

    #[error("connection is closed")]
    Closed,
}

/// Message fragments that mark a transport failure as reconnectable.
const RECONNECTABLE: &[&str] = &[
    "stream error",
    "goaway",
    "rst_stream",
    "eof",
    "connection reset",
    "trip not found",
    "no cached connection",
];

/// Whether an error message text indicates the connection should be torn
/// down and re-established before retrying.
pub fn is_reconnectable(message: &str) -> bool {
    let lower = message.to_lowercase();
    RECONNECTABLE.iter().any(|needle| lower.contains(needle))
}

impl TransportError {
    pub fn is_reconnectable(&self) -> bool {
        match self {
            TransportError::Http(msg) => is_reconnectable(msg),
            TransportError::Closed => true,
            _ => false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    /// Bearer sent when the call context carries none.
    default_bearer: Option<String>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, default_bearer: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            default_bearer,
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the transport dead; subsequent sends fail with `Closed`.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Send a JSON-RPC request and wait for the response.
    ///
    /// `bearer` from the invocation context wins over the configured default.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        bearer: Option<&str>,
    ) -> Result<JsonRpcResponse, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let mut builder = self.client.post(&self.url).json(&request);
        let token = bearer.or(self.default_bearer.as_deref());
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }

        let resp = builder.send().await.map_err(|e| {
            // A broken connection poisons the client's pool state; flag the
            // transport so the manager rebuilds it.
            let message = e.to_string();
            if is_reconnectable(&message) {
                self.close();
            }
            TransportError::Http(message)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status(status.as_u16(), text));
        }

        let response: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(response)
    }
}
