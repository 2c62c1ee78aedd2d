//! Elicitation and approval callbacks — the external resolvers that
//! unblock suspended turns.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use pv_domain::error::Error;
use pv_domain::trace::TraceEvent;

use crate::api::envelope::{self, ApiResult};
use crate::runtime::awaiter::Resolution;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Elicitation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ElicitationRequest {
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

pub async fn resolve_elicitation(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(body): Json<ElicitationRequest>,
) -> ApiResult {
    let resolution = match body.action.as_str() {
        "accept" => Resolution::Accept {
            payload: body.payload,
        },
        "decline" => Resolution::Decline { reason: None },
        "cancel" => Resolution::Cancel,
        other => {
            return Err(Error::Validation(format!("unknown action '{other}'")).into());
        }
    };

    if state.awaiters.resolve(&message_id, resolution).is_none() {
        return Err(Error::NotFound(format!("no pending prompt for message {message_id}")).into());
    }

    TraceEvent::ElicitationResolved {
        message_id,
        action: body.action,
    }
    .emit();
    Ok(envelope::no_content())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub action: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn resolve_approval(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(body): Json<ApprovalRequest>,
) -> ApiResult {
    let resolution = match body.action.as_str() {
        "accept" | "approve" | "approved" | "yes" | "y" => {
            Resolution::Accept { payload: None }
        }
        "decline" | "deny" | "reject" | "no" | "n" => Resolution::Decline {
            reason: body.reason.clone(),
        },
        // Cancel acknowledges without resolving; the prompt stays pending.
        "cancel" => return Ok(envelope::no_content()),
        other => {
            return Err(Error::Validation(format!("unknown action '{other}'")).into());
        }
    };

    if state.awaiters.resolve(&message_id, resolution).is_none() {
        return Err(Error::NotFound(format!("no pending prompt for message {message_id}")).into());
    }

    TraceEvent::ElicitationResolved {
        message_id,
        action: body.action,
    }
    .emit();
    Ok(envelope::no_content())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Introspection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_pending(State(state): State<AppState>) -> ApiResult {
    Ok(envelope::ok(
        serde_json::to_value(state.awaiters.list_pending()).unwrap_or(Value::Null),
    ))
}
