//! Proxy manager — per-conversation client connections to tool servers.
//!
//! `acquire` reuses an existing client or establishes one; `reconnect`
//! tears down and rebuilds after a reconnectable transport failure; a reaper
//! drops clients idle past the configured TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use pv_domain::config::ToolServerConfig;
use pv_domain::error::{Error, Result};
use pv_domain::trace::TraceEvent;

use crate::client::ServerClient;

/// Conversation id used by the catalog monitor, which is not tied to any
/// user conversation.
pub const CATALOG_SCOPE: &str = "__catalog__";

pub struct ProxyManager {
    servers: Vec<ToolServerConfig>,
    /// conversation id → server name → client.
    clients: RwLock<HashMap<String, HashMap<String, Arc<ServerClient>>>>,
    /// Serializes connection establishment so concurrent acquires don't
    /// race to spawn duplicate clients.
    connect_lock: AsyncMutex<()>,
}

impl ProxyManager {
    pub fn new(servers: Vec<ToolServerConfig>) -> Self {
        Self {
            servers,
            clients: RwLock::new(HashMap::new()),
            connect_lock: AsyncMutex::new(()),
        }
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn server_config(&self, server: &str) -> Option<&ToolServerConfig> {
        self.servers.iter().find(|s| s.name == server)
    }

    /// Strip a matching server prefix off a canonical tool name before
    /// dispatch: `db/ping` sent to server `db` becomes `ping`.
    pub fn local_name<'a>(server: &str, tool_name: &'a str) -> &'a str {
        tool_name
            .strip_prefix(server)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(tool_name)
    }

    /// Get or establish the client for `(conversation, server)`.
    pub async fn acquire(&self, conversation_id: &str, server: &str) -> Result<Arc<ServerClient>> {
        if let Some(client) = self.lookup(conversation_id, server) {
            if client.is_alive() {
                client.touch();
                return Ok(client);
            }
        }

        let _guard = self.connect_lock.lock().await;
        // Someone may have connected while we waited.
        if let Some(client) = self.lookup(conversation_id, server) {
            if client.is_alive() {
                return Ok(client);
            }
        }

        let config = self
            .server_config(server)
            .ok_or_else(|| Error::NotFound(format!("tool server '{server}'")))?
            .clone();
        let client = Arc::new(ServerClient::connect(&config).await?);
        self.clients
            .write()
            .entry(conversation_id.to_owned())
            .or_default()
            .insert(server.to_owned(), client.clone());
        Ok(client)
    }

    /// Tear down and re-establish the client for `(conversation, server)`.
    /// Outstanding calls on the old client fail with a transient error.
    pub async fn reconnect(
        &self,
        conversation_id: &str,
        server: &str,
        attempt: u32,
    ) -> Result<Arc<ServerClient>> {
        if let Some(old) = self.remove(conversation_id, server) {
            old.close();
        }
        TraceEvent::ProxyReconnected {
            server: server.to_owned(),
            attempt,
        }
        .emit();
        self.acquire(conversation_id, server).await
    }

    /// Drop every client a conversation holds (called on delete).
    pub fn drop_conversation(&self, conversation_id: &str) {
        if let Some(clients) = self.clients.write().remove(conversation_id) {
            for client in clients.values() {
                client.close();
            }
        }
    }

    /// Reap clients idle past `ttl`. Returns how many were dropped.
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let mut reaped = 0;
        let mut clients = self.clients.write();
        for per_conv in clients.values_mut() {
            per_conv.retain(|server, client| {
                if client.idle_for() > ttl {
                    tracing::debug!(server = %server, "reaping idle tool-server client");
                    client.close();
                    reaped += 1;
                    false
                } else {
                    true
                }
            });
        }
        clients.retain(|_, per_conv| !per_conv.is_empty());
        reaped
    }

    /// Number of live clients (for introspection).
    pub fn client_count(&self) -> usize {
        self.clients.read().values().map(|m| m.len()).sum()
    }

    fn lookup(&self, conversation_id: &str, server: &str) -> Option<Arc<ServerClient>> {
        self.clients
            .read()
            .get(conversation_id)
            .and_then(|m| m.get(server))
            .cloned()
    }

    fn remove(&self, conversation_id: &str, server: &str) -> Option<Arc<ServerClient>> {
        self.clients
            .write()
            .get_mut(conversation_id)
            .and_then(|m| m.remove(server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_name_strips_matching_prefix_only() {
        assert_eq!(ProxyManager::local_name("db", "db/ping"), "ping");
        assert_eq!(ProxyManager::local_name("db", "files/read"), "files/read");
        // A server name that happens to prefix the service is not a match
        // without the separator.
        assert_eq!(ProxyManager::local_name("db", "dbx/ping"), "dbx/ping");
    }

    #[test]
    fn unknown_server_is_not_found() {
        let manager = ProxyManager::new(Vec::new());
        let err = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(manager.acquire("c1", "missing"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn server_names_come_from_config() {
        let manager = ProxyManager::new(vec![
            ToolServerConfig {
                name: "db".into(),
                url: "http://localhost:9000/rpc".into(),
                bearer_env: None,
                call_timeout_sec: None,
            },
            ToolServerConfig {
                name: "files".into(),
                url: "http://localhost:9001/rpc".into(),
                bearer_env: None,
                call_timeout_sec: Some(30),
            },
        ]);
        assert_eq!(manager.server_names(), vec!["db", "files"]);
        assert_eq!(
            manager.server_config("files").unwrap().call_timeout_sec,
            Some(30)
        );
    }
}
