use std::sync::Arc;

use chrono::{DateTime, Utc};

use pv_domain::config::Config;
use pv_providers::ProviderRegistry;
use pv_transcript::TranscriptStore;

use crate::runtime::awaiter::AwaiterRegistry;
use crate::runtime::cancel::CancelRegistry;
use crate::runtime::events::EventPublisher;
use crate::runtime::registry::ToolRegistry;
use crate::runtime::services::ChildRunnerSlot;

/// The caller identity attached to each request.
///
/// The bearer (when present) travels with the turn and is injected into
/// every tool-proxy call.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub bearer: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".into(),
            bearer: None,
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            subject: "token".into(),
            bearer: Some(token.into()),
        }
    }
}

/// Shared application state passed to all API handlers and the runtime.
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub store: Arc<TranscriptStore>,
    pub providers: Arc<ProviderRegistry>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub tools: Arc<ToolRegistry>,
    pub cancels: Arc<CancelRegistry>,
    pub events: Arc<EventPublisher>,
    pub awaiters: Arc<AwaiterRegistry>,
    /// Late-bound `agent/run` capability, installed at bootstrap.
    pub child_runner: Arc<ChildRunnerSlot>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 of the API bearer token. `None` = dev mode (no auth).
    pub api_token_hash: Option<Vec<u8>>,

    pub started_at: DateTime<Utc>,
}
