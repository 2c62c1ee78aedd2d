//! Clients for remote tool servers: JSON-RPC over HTTP, per-conversation
//! connection management, reconnect classification and bearer injection.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use client::ServerClient;
pub use manager::ProxyManager;
pub use protocol::{CallResult, RemoteToolDef};
pub use transport::{is_reconnectable, TransportError};
