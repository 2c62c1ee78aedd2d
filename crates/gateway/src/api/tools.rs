//! Federated tool-catalog introspection.

use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::Value;

use crate::api::envelope::{self, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ToolsQuery {
    #[serde(default)]
    pub pattern: Option<String>,
}

pub async fn list_tools(State(state): State<AppState>, Query(q): Query<ToolsQuery>) -> ApiResult {
    let tools: Vec<Value> = match q.pattern.as_deref() {
        Some(pattern) => state
            .tools
            .match_pattern(pattern)
            .into_iter()
            .map(|d| serde_json::to_value(&d).unwrap_or(Value::Null))
            .collect(),
        None => state
            .tools
            .list_catalog()
            .into_iter()
            .map(|(def, server, overlay)| {
                serde_json::json!({
                    "name": def.name,
                    "description": def.description,
                    "parameters": def.parameters,
                    "timeoutSec": def.timeout_sec,
                    "server": server,
                    "overlay": overlay,
                })
            })
            .collect(),
    };
    Ok(envelope::ok(Value::Array(tools)))
}
