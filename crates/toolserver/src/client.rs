//! A connected client for one tool server.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use pv_domain::config::ToolServerConfig;
use pv_domain::error::{Error, Result};
use pv_domain::tool::ToolOutcome;

use crate::protocol::{CallResult, RemoteToolDef, ToolsListResult};
use crate::transport::{HttpTransport, TransportError};

/// One live connection to a tool server. Created by the manager, shared per
/// conversation.
#[derive(Debug)]
pub struct ServerClient {
    name: String,
    transport: HttpTransport,
    call_timeout: Option<Duration>,
    last_used: Mutex<Instant>,
}

impl ServerClient {
    /// Connect and perform the `initialize` handshake.
    pub async fn connect(config: &ToolServerConfig) -> Result<Self> {
        let default_bearer = config
            .bearer_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty());

        let client = Self {
            name: config.name.clone(),
            transport: HttpTransport::new(config.url.clone(), default_bearer),
            call_timeout: config.call_timeout_sec.map(Duration::from_secs),
            last_used: Mutex::new(Instant::now()),
        };

        let params = serde_json::json!({
            "clientInfo": { "name": "palaver", "version": env!("CARGO_PKG_VERSION") },
        });
        client
            .transport
            .send_request("initialize", Some(params), None)
            .await
            .map_err(|e| client.map_transport_error(e))?
            .into_result()
            .map_err(|e| Error::Permanent(format!("{}: initialize: {e}", client.name)))?;

        tracing::debug!(server = %client.name, "tool server initialized");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The server's configured per-call timeout, if any.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Extend the client's last-used timestamp.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Tear the connection down; outstanding calls fail with a transient
    /// error.
    pub fn close(&self) {
        self.transport.close();
    }

    /// Discover the server's tools.
    pub async fn list_tools(&self) -> Result<Vec<RemoteToolDef>> {
        self.touch();
        let result = self
            .transport
            .send_request("tools/list", None, None)
            .await
            .map_err(|e| self.map_transport_error(e))?
            .into_result()
            .map_err(|e| Error::Permanent(format!("{}: tools/list: {e}", self.name)))?;

        let parsed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| Error::Permanent(format!("{}: malformed tools/list: {e}", self.name)))?;
        Ok(parsed.tools)
    }

    /// Call a tool. `method` is the server-local name (prefix already
    /// stripped); `bearer` comes from the invocation context.
    pub async fn call_tool(
        &self,
        method: &str,
        arguments: Value,
        bearer: Option<&str>,
    ) -> Result<ToolOutcome> {
        self.touch();
        let params = serde_json::json!({
            "name": method,
            "arguments": arguments,
        });

        let result = self
            .transport
            .send_request("tools/call", Some(params), bearer)
            .await
            .map_err(|e| self.map_transport_error(e))?
            .into_result()
            .map_err(|e| Error::Permanent(format!("{}: {e}", self.name)))?;

        let parsed: CallResult = serde_json::from_value(result)
            .map_err(|e| Error::Permanent(format!("{}: malformed tools/call: {e}", self.name)))?;

        if parsed.is_error {
            let outcome = parsed.into_outcome();
            return Err(Error::Permanent(outcome.render()));
        }
        Ok(parsed.into_outcome())
    }

    fn map_transport_error(&self, e: TransportError) -> Error {
        if e.is_reconnectable() {
            Error::Transient(format!("{}: {e}", self.name))
        } else {
            match e {
                TransportError::Status(code, text) if code >= 500 => {
                    Error::Transient(format!("{}: status {code}: {text}", self.name))
                }
                other => Error::Permanent(format!("{}: {other}", self.name)),
            }
        }
    }
}
