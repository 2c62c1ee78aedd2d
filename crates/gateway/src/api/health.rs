//! Health probe (public, no auth).

use axum::extract::State;
use chrono::Utc;

use crate::api::envelope::{self, ApiResult};
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> ApiResult {
    let uptime_sec = (Utc::now() - state.started_at).num_seconds().max(0);
    Ok(envelope::ok(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSec": uptime_sec,
        "providers": state.providers.provider_ids(),
        "toolServers": state.tools.proxies().server_names(),
        "catalogSize": state.tools.list_catalog().len(),
        "proxyClients": state.tools.proxies().client_count(),
    })))
}
