//! Conversation endpoints — create/list, message accept, message listing
//! with the live stage, and turn termination.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::Value;

use pv_transcript::{ListFilter, NewConversation, Visibility};

use crate::api::envelope::{self, ApiResult};
use crate::runtime::{self, stage, AcceptQuery, ToolPolicy};
use crate::state::{AppState, Identity};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Create / list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateConversationRequest>,
) -> ApiResult {
    let conversation = state.store.create_conversation(NewConversation {
        title: body.title.unwrap_or_default(),
        visibility: body.visibility.unwrap_or_default(),
        created_by: identity.subject,
        agent_id: body.agent,
        default_model: body.model,
        tool_patterns: body.tools,
    })?;
    Ok(envelope::ok(serde_json::to_value(&conversation).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub archived: Option<u8>,
}

pub async fn list(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult {
    if let Some(id) = q.id {
        let conversation = state.store.get_conversation(&id)?;
        return Ok(envelope::ok(
            serde_json::to_value(&conversation).unwrap_or(Value::Null),
        ));
    }
    let conversations = state.store.list_conversations(q.archived == Some(1));
    Ok(envelope::ok(
        serde_json::to_value(&conversations).unwrap_or(Value::Null),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    #[serde(default)]
    pub archived: bool,
}

pub async fn archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ArchiveRequest>,
) -> ApiResult {
    state.store.set_archived(&id, body.archived)?;
    Ok(envelope::no_content())
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.cancels.cancel_conversation(&id);
    state.store.delete_conversation(&id)?;
    state.events.drop_conversation(&id);
    state.tools.proxies().drop_conversation(&id);
    Ok(envelope::no_content())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message accept (202)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub context: Option<MessageContext>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageContext {
    #[serde(default, rename = "toolPolicy")]
    pub tool_policy: ToolPolicy,
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<PostMessageRequest>,
) -> ApiResult {
    let accepted = runtime::accept(
        &state,
        AcceptQuery {
            conversation_id: Some(id),
            content: body.content,
            agent: body.agent,
            model: body.model,
            tools: body.tools,
            tool_policy: body.context.unwrap_or_default().tool_policy,
            identity,
        },
    )
    .await?;
    Ok(envelope::accepted(
        serde_json::to_value(&accepted).unwrap_or(Value::Null),
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message listing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub since: Option<u64>,
    #[serde(default, rename = "includeModelCallPayload")]
    pub include_model_call_payload: Option<u8>,
    #[serde(default)]
    pub interim: Option<u8>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<MessagesQuery>,
) -> ApiResult {
    let all = state.store.list_messages(
        &id,
        ListFilter {
            include_interim: true,
            include_tool_calls: true,
            ..Default::default()
        },
    )?;
    let phase = stage::compute(&all);

    let messages: Vec<_> = all
        .iter()
        .filter(|m| q.interim == Some(1) || !m.interim)
        .filter(|m| q.since.is_none_or(|s| m.seq > s))
        .collect();

    // A tail request with nothing new while the turn is live answers
    // "still thinking".
    if q.since.is_some()
        && messages.is_empty()
        && matches!(
            phase,
            stage::Phase::Thinking | stage::Phase::Executing | stage::Phase::Eliciting
        )
    {
        return Ok(envelope::processing(phase));
    }

    let mut rendered: Vec<Value> = Vec::with_capacity(messages.len());
    for m in messages {
        let mut v = serde_json::to_value(m).unwrap_or(Value::Null);
        if q.include_model_call_payload == Some(1) {
            if let Some(mc) = &m.model_call {
                let mut payloads = serde_json::Map::new();
                for (key, pid) in [
                    ("prompt", &mc.prompt_payload_id),
                    ("response", &mc.response_payload_id),
                ] {
                    if let Some(pid) = pid {
                        if let Ok((_, body)) = state.store.get_payload(pid) {
                            payloads.insert(
                                key.to_owned(),
                                Value::String(String::from_utf8_lossy(&body).into_owned()),
                            );
                        }
                    }
                }
                v["modelCallPayload"] = Value::Object(payloads);
            }
        }
        rendered.push(v);
    }

    Ok(envelope::ok_with_stage(
        serde_json::json!({ "messages": rendered }),
        phase,
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn terminate(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    // 404 for unknown conversations, 204 when idle.
    state.store.get_conversation(&id)?;
    if state.cancels.cancel_conversation(&id) {
        return Ok((
            StatusCode::ACCEPTED,
            axum::Json(serde_json::json!({ "status": "ACCEPTED", "data": { "cancelled": true } })),
        )
            .into_response());
    }
    Ok(envelope::no_content())
}
