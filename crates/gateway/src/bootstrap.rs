//! AppState construction and background-task spawning.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use sha2::{Digest, Sha256};

use pv_domain::config::{Config, ConfigSeverity};
use pv_providers::ProviderRegistry;
use pv_toolserver::ProxyManager;
use pv_transcript::TranscriptStore;

use crate::api;
use crate::runtime::awaiter::AwaiterRegistry;
use crate::runtime::cancel::CancelRegistry;
use crate::runtime::events::EventPublisher;
use crate::runtime::monitor;
use crate::runtime::registry::ToolRegistry;
use crate::runtime::services::{self, ChildRunnerSlot};
use crate::runtime::OrchestratorRunner;
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Transcript store ─────────────────────────────────────────────
    let store = Arc::new(
        TranscriptStore::new(&config.state.path, config.limits.inline_payload_cap)
            .context("initializing transcript store")?,
    );
    tracing::info!(path = %config.state.path.display(), "transcript store ready");

    // ── Model providers ──────────────────────────────────────────────
    let providers = Arc::new(ProviderRegistry::from_config(&config.llm));
    if providers.is_empty() {
        tracing::info!("no model providers initialized — configure API keys to enable turns");
    } else {
        tracing::info!(providers = providers.len(), "model provider registry ready");
    }

    // ── Tool registry + overlay ──────────────────────────────────────
    let proxies = Arc::new(ProxyManager::new(config.tool_servers.clone()));
    let tools = Arc::new(ToolRegistry::new(config.registry.clone(), proxies));
    let child_runner = Arc::new(ChildRunnerSlot::new());
    services::register_overlay(&tools, &config.agents, child_runner.clone());
    tracing::info!(
        servers = config.tool_servers.len(),
        agents = config.agents.len(),
        "tool registry ready"
    );

    // ── API token (read once) ────────────────────────────────────────
    let api_token_hash = std::env::var(&config.server.api_token_env)
        .ok()
        .filter(|t| !t.is_empty())
        .map(|t| Sha256::digest(t.as_bytes()).to_vec());
    if api_token_hash.is_none() {
        tracing::warn!(
            env = %config.server.api_token_env,
            "no API token configured — running without authentication (dev mode)"
        );
    }

    let state = AppState {
        config,
        store,
        providers,
        tools,
        cancels: Arc::new(CancelRegistry::new()),
        events: Arc::new(EventPublisher::new()),
        awaiters: Arc::new(AwaiterRegistry::new()),
        child_runner,
        api_token_hash,
        started_at: Utc::now(),
    };

    // The orchestrator implements agent/run; installed late to break the
    // registry ↔ orchestrator cycle.
    state
        .child_runner
        .install(Arc::new(OrchestratorRunner::new(state.clone())));

    Ok(state)
}

/// Spawn catalog monitors and the idle reaper.
pub fn spawn_background(state: &AppState) {
    monitor::spawn_monitors(state.tools.clone());
}

/// Boot the full runtime and serve HTTP until shutdown.
pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = build_app_state(config).await?;
    spawn_background(&state);

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "palaver listening");
    axum::serve(listener, app).await.context("serving HTTP")
}
