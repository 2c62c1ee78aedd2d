//! The planner loop.
//!
//! Each iteration binds the transcript and tool catalog, asks the model for
//! either a final answer, an elicitation request, or a tool plan, executes
//! plan steps sequentially through the registry, and feeds outcomes back.
//! The loop terminates on an answer, a resolved-or-declined elicitation, a
//! recorded failure, or cancellation.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use pv_domain::error::{Error, ErrorKind, Result};
use pv_domain::tool::{canonical_tool_name, split_selector, ChatContent, ChatMessage, ContentPart, ToolCall};
use pv_transcript::{
    Attachment, CallStatus, Elicitation, MessageBody, MessagePatch, MessageRecord, MessageRole,
    MessageStatus, NewMessage, ToolCallFacet, TurnStatus,
};

use crate::state::AppState;

use super::awaiter::{Resolution, WaitKind};
use super::invoker::{self, Binding};
use super::registry::CallContext;
use super::{ToolPolicy, TurnContext};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive the turn to a terminal state.
///
/// `Ok(status)` means a terminal message is already recorded; `Err` means
/// the failure is not yet visible in the transcript and the orchestrator
/// must record it.
pub(super) async fn run_planner_loop(state: &AppState, ctx: &TurnContext) -> Result<TurnStatus> {
    let mut previous_response_id: Option<String> = None;

    for loop_idx in 0..state.config.limits.max_plan_loops {
        tracing::debug!(loop_idx, "planner iteration");
        if ctx.cancel.is_cancelled() {
            return Ok(TurnStatus::Cancelled);
        }

        // ── Bind and invoke ──────────────────────────────────────────
        let binding = build_binding(state, ctx, previous_response_id.take())?;
        let outcome = match invoker::generate(state, ctx, binding).await {
            Ok(o) => o,
            Err(Error::Cancelled) => return Ok(TurnStatus::Cancelled),
            // The invoker records provider failures on the model-call
            // message; the turn fails without a second terminal record.
            Err(e) if e.kind() == ErrorKind::Permanent => {
                tracing::warn!(error = %e, "model invocation failed");
                return Ok(TurnStatus::Failed);
            }
            Err(e) => return Err(e),
        };
        previous_response_id = outcome.response_id.clone();

        // ── Three-way parse: elicitation / answer / plan ─────────────
        if let Some(elicitation) = parse_inline_elicitation(&outcome.text) {
            let status = handle_elicitation(state, ctx, &outcome.message, elicitation).await?;
            match status {
                ElicitationEnd::Resumed => continue,
                ElicitationEnd::Declined => return Ok(TurnStatus::Cancelled),
                ElicitationEnd::TimedOut => return Ok(TurnStatus::Failed),
            }
        }

        if outcome.tool_calls.is_empty() {
            if outcome.text.trim().is_empty() {
                let patched = state.store.patch_message(MessagePatch {
                    message_id: outcome.message.id.clone(),
                    status: Some(MessageStatus::Failed),
                    interim: Some(false),
                    content: Some(MessageBody::Text("unable to generate plan".into())),
                    ..Default::default()
                })?;
                state.events.publish(&patched);
                return Ok(TurnStatus::Failed);
            }

            // Final answer.
            let patched = state.store.patch_message(MessagePatch {
                message_id: outcome.message.id.clone(),
                status: Some(MessageStatus::Done),
                interim: Some(false),
                content: Some(MessageBody::Text(outcome.text.clone())),
                ..Default::default()
            })?;
            state.events.publish(&patched);
            return Ok(TurnStatus::Succeeded);
        }

        // ── Finalize the plan message ────────────────────────────────
        // Tool calls stay in the structured content so later bindings can
        // rebuild the call/result pairing for the provider.
        let plan_content = if outcome.text.trim().is_empty() {
            MessageBody::Structured(serde_json::json!({ "toolCalls": outcome.tool_calls }))
        } else {
            MessageBody::Structured(serde_json::json!({
                "text": outcome.text,
                "toolCalls": outcome.tool_calls,
            }))
        };
        let patched = state.store.patch_message(MessagePatch {
            message_id: outcome.message.id.clone(),
            status: Some(MessageStatus::Done),
            interim: Some(false),
            content: Some(plan_content),
            ..Default::default()
        })?;
        state.events.publish(&patched);

        // ── Execute plan steps sequentially ──────────────────────────
        for step in &outcome.tool_calls {
            if ctx.cancel.is_cancelled() {
                return Ok(TurnStatus::Cancelled);
            }
            match execute_step(state, ctx, step, outcome.response_id.as_deref()).await? {
                StepEnd::Continue => {}
                StepEnd::Cancelled => return Ok(TurnStatus::Cancelled),
            }
        }
    }

    let limit = state.config.limits.max_plan_loops;
    let mut terminal = NewMessage::new(
        &ctx.conversation.id,
        MessageRole::Assistant,
        MessageBody::Text(format!("tool loop limit reached ({limit} iterations)")),
    );
    terminal.turn_id = Some(ctx.turn_id);
    terminal.status = MessageStatus::Failed;
    let terminal = state.store.append_message(terminal)?;
    state.events.publish(&terminal);
    Ok(TurnStatus::Failed)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Binding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEFAULT_SYSTEM_PROMPT: &str = "You are a tool-using assistant. Work through the \
user's request step by step, calling tools when they help. When you are missing \
required information only the user can supply, respond with a single JSON object \
{\"type\":\"elicitation\",\"message\":\"...\",\"requestedSchema\":{...,\"required\":[...]}} \
and nothing else.";

fn build_binding(
    state: &AppState,
    ctx: &TurnContext,
    previous_response_id: Option<String>,
) -> Result<Binding> {
    let system_prompt = ctx
        .agent
        .as_ref()
        .and_then(|a| a.system_prompt.clone())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());

    let history = state
        .store
        .normalized_transcript(&ctx.conversation.id)?
        .iter()
        .filter_map(record_to_chat)
        .collect();

    // Deny suppresses the tool surface entirely.
    let tools = if ctx.tool_policy == ToolPolicy::Deny {
        Vec::new()
    } else {
        let patterns = effective_patterns(ctx);
        state.tools.definitions_for(&patterns)
    };

    Ok(Binding {
        system_prompt,
        history,
        tools,
        previous_response_id,
    })
}

/// Per-turn patterns narrow the conversation's; the agent's narrow both.
fn effective_patterns(ctx: &TurnContext) -> Vec<String> {
    let mut patterns = ctx.tool_patterns.clone();
    if patterns.is_empty() {
        patterns = ctx.conversation.tool_patterns.clone();
    }
    if patterns.is_empty() {
        if let Some(agent) = &ctx.agent {
            patterns = agent.tools.clone();
        }
    }
    patterns
}

fn record_to_chat(m: &MessageRecord) -> Option<ChatMessage> {
    match m.role {
        MessageRole::User => Some(ChatMessage::user(m.content.all_text())),
        MessageRole::System => Some(ChatMessage::system(m.content.all_text())),
        MessageRole::Assistant => {
            // A plan message carries its tool calls in structured content;
            // rebuild them as tool-use parts so providers can pair them
            // with the tool results that follow.
            if let MessageBody::Structured(v) = &m.content {
                if let Some(calls) = v.get("toolCalls").and_then(|c| c.as_array()) {
                    let mut parts: Vec<ContentPart> = Vec::new();
                    if let Some(text) = v.get("text").and_then(|t| t.as_str()) {
                        parts.push(ContentPart::Text { text: text.to_owned() });
                    }
                    parts.extend(calls.iter().filter_map(|c| {
                        Some(ContentPart::ToolUse {
                            id: c.get("call_id")?.as_str()?.to_owned(),
                            name: c.get("tool_name")?.as_str()?.to_owned(),
                            input: c.get("arguments").cloned().unwrap_or(Value::Null),
                        })
                    }));
                    if !parts.is_empty() {
                        return Some(ChatMessage {
                            role: pv_domain::tool::Role::Assistant,
                            content: ChatContent::Parts(parts),
                        });
                    }
                }
            }
            let text = m.content.all_text();
            if text.is_empty() {
                None
            } else {
                Some(ChatMessage::assistant(text))
            }
        }
        MessageRole::Tool => {
            let tc = m.tool_call.as_ref()?;
            Some(ChatMessage::tool_result(
                tc.op_id.clone(),
                m.content.all_text(),
                tc.status == CallStatus::Failed,
            ))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inline elicitation detection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Detect `{"type":"elicitation", ...}` in assistant content, either bare
/// or inside a fenced code block.
pub(super) fn parse_inline_elicitation(text: &str) -> Option<Elicitation> {
    let trimmed = text.trim();

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if let Some(e) = Elicitation::from_value(&v) {
            return Some(e);
        }
    }

    // Fenced blocks: ```json ... ``` or plain ``` ... ```.
    let mut rest = trimmed;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let Some(end) = body.find("```") else { break };
        if let Ok(v) = serde_json::from_str::<Value>(body[..end].trim()) {
            if let Some(e) = Elicitation::from_value(&v) {
                return Some(e);
            }
        }
        rest = &body[end + 3..];
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Elicitation handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum ElicitationEnd {
    Resumed,
    Declined,
    TimedOut,
}

async fn handle_elicitation(
    state: &AppState,
    ctx: &TurnContext,
    message: &MessageRecord,
    elicitation: Elicitation,
) -> Result<ElicitationEnd> {
    let prompt_text = if elicitation.message.is_empty() {
        "additional input required".to_owned()
    } else {
        elicitation.message.clone()
    };
    let patched = state.store.patch_message(MessagePatch {
        message_id: message.id.clone(),
        interim: Some(false),
        content: Some(MessageBody::Text(prompt_text)),
        elicitation: Some(elicitation),
        ..Default::default()
    })?;

    // Register before publishing so a resolver reacting to the event
    // always finds the waiter.
    let rx = state
        .awaiters
        .register(&patched.id, &ctx.conversation.id, WaitKind::Elicitation);
    state.events.publish(&patched);
    let resolution = await_resolution(state, ctx, &patched.id, rx).await;

    match resolution {
        Some(Resolution::Accept { payload }) => {
            let done = state.store.patch_message(MessagePatch {
                message_id: patched.id.clone(),
                status: Some(MessageStatus::Done),
                ..Default::default()
            })?;
            state.events.publish(&done);

            let mut reply = NewMessage::new(
                &ctx.conversation.id,
                MessageRole::User,
                MessageBody::Structured(payload.unwrap_or(Value::Object(Default::default()))),
            );
            reply.turn_id = Some(ctx.turn_id);
            reply.parent_id = Some(patched.id);
            let reply = state.store.append_message(reply)?;
            state.events.publish(&reply);
            Ok(ElicitationEnd::Resumed)
        }
        Some(Resolution::Decline { .. }) | Some(Resolution::Cancel) => {
            let declined = state.store.patch_message(MessagePatch {
                message_id: patched.id,
                status: Some(MessageStatus::Declined),
                ..Default::default()
            })?;
            state.events.publish(&declined);
            Ok(ElicitationEnd::Declined)
        }
        None => {
            // Timed out (or the turn was cancelled while waiting).
            state.awaiters.remove_expired(&patched.id);
            let failed = state.store.patch_message(MessagePatch {
                message_id: patched.id,
                status: Some(MessageStatus::Failed),
                ..Default::default()
            })?;
            state.events.publish(&failed);
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Ok(ElicitationEnd::TimedOut)
        }
    }
}

/// Park on the resolver, bounded by the configured timeout and the turn's
/// cancel token.
async fn await_resolution(
    state: &AppState,
    ctx: &TurnContext,
    message_id: &str,
    rx: tokio::sync::oneshot::Receiver<Resolution>,
) -> Option<Resolution> {
    let timeout = Duration::from_secs(state.config.interactive.elicitation_timeout_sec);
    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            state.awaiters.remove_expired(message_id);
            None
        }
        r = tokio::time::timeout(timeout, rx) => match r {
            Ok(Ok(resolution)) => Some(resolution),
            _ => None,
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan-step execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum StepEnd {
    Continue,
    Cancelled,
}

async fn execute_step(
    state: &AppState,
    ctx: &TurnContext,
    step: &ToolCall,
    trace_id: Option<&str>,
) -> Result<StepEnd> {
    let canonical = canonical_tool_name(split_selector(&step.tool_name).0);

    // ── Record the call in running state ─────────────────────────────
    let request_payload = state
        .store
        .append_payload("application/json", &serde_json::to_vec(&step.arguments)?)?;
    let mut new = NewMessage::new(
        &ctx.conversation.id,
        MessageRole::Tool,
        MessageBody::Structured(step.arguments.clone()),
    );
    new.turn_id = Some(ctx.turn_id);
    new.status = MessageStatus::Open;
    new.tool_call = Some(ToolCallFacet {
        op_id: step.call_id.clone(),
        tool_name: canonical.clone(),
        arguments: step.arguments.clone(),
        status: CallStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
        error: None,
        request_payload_id: Some(request_payload.id),
        response_payload_id: None,
        trace_id: trace_id.map(String::from),
    });
    let tool_msg = state.store.append_message(new)?;
    state.events.publish(&tool_msg);

    // ── Policy gate ──────────────────────────────────────────────────
    match ctx.tool_policy {
        ToolPolicy::Auto => {}
        ToolPolicy::Deny => {
            return fail_step(
                state,
                &tool_msg,
                &format!("tool {canonical} denied by policy"),
            )
            .map(|_| StepEnd::Continue);
        }
        ToolPolicy::Ask => match request_approval(state, ctx, &canonical, step).await? {
            ApprovalEnd::Approved => {}
            ApprovalEnd::Declined(reason) => {
                let text = match reason {
                    Some(r) => format!("approval declined: {r}"),
                    None => "approval declined".to_owned(),
                };
                return fail_step(state, &tool_msg, &text).map(|_| StepEnd::Continue);
            }
            ApprovalEnd::Cancelled => {
                fail_step(state, &tool_msg, "cancelled")?;
                return Ok(StepEnd::Cancelled);
            }
        },
    }

    // ── Dispatch ─────────────────────────────────────────────────────
    let call_ctx = CallContext {
        conversation_id: ctx.conversation.id.clone(),
        bearer: ctx.identity.bearer.clone(),
        deadline: None,
        cancel: ctx.cancel.clone(),
    };

    match state.tools.execute(&call_ctx, &step.tool_name, &step.arguments).await {
        Ok(result) => {
            let rendered = result.outcome.render();

            // Attachments: binary content linked by payload reference.
            let mut attachments = Vec::new();
            if let Some(data) = &result.outcome.data {
                use base64::Engine as _;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap_or_else(|_| data.clone().into_bytes());
                let payload = state
                    .store
                    .append_payload("application/octet-stream", &bytes)?;
                attachments.push(Attachment {
                    payload_id: payload.id,
                    name: None,
                    mime: "application/octet-stream".into(),
                });
            }
            if attachments.len() > state.config.limits.attachment_cap {
                return fail_step(
                    state,
                    &tool_msg,
                    &format!(
                        "payload too large: {} attachments exceed the cap of {}",
                        attachments.len(),
                        state.config.limits.attachment_cap
                    ),
                )
                .map(|_| StepEnd::Continue);
            }

            // Response payload: fresh executions store one; memo hits
            // share the original.
            let response_payload_id = if result.memo_hit {
                result.memoized_payload
            } else {
                let mime = if result.outcome.structured.is_some() {
                    "application/json"
                } else {
                    "text/plain"
                };
                let payload = state.store.append_payload(mime, rendered.as_bytes())?;
                state.tools.record_payload(
                    &ctx.conversation.id,
                    &step.tool_name,
                    &step.arguments,
                    &payload.id,
                );
                Some(payload.id)
            };

            let mut facet = tool_msg.tool_call.clone().unwrap_or_else(|| {
                unreachable_facet(&tool_msg)
            });
            facet.status = CallStatus::Completed;
            facet.completed_at = Some(Utc::now());
            facet.response_payload_id = response_payload_id;

            let patched = state.store.patch_message(MessagePatch {
                message_id: tool_msg.id.clone(),
                status: Some(MessageStatus::Done),
                content: Some(MessageBody::Text(if rendered.is_empty() {
                    "(no output)".to_owned()
                } else {
                    rendered
                })),
                attachments: Some(attachments),
                tool_call: Some(facet),
                ..Default::default()
            })?;
            state.events.publish(&patched);
            Ok(StepEnd::Continue)
        }
        Err(Error::Cancelled) => {
            fail_step(state, &tool_msg, "cancelled")?;
            Ok(StepEnd::Cancelled)
        }
        Err(e) => {
            fail_step(state, &tool_msg, &e.to_string())?;
            Ok(StepEnd::Continue)
        }
    }
}

/// Record a step failure. Short error strings inline into the message;
/// long ones are stored as payloads and referenced.
fn fail_step(state: &AppState, tool_msg: &MessageRecord, error: &str) -> Result<()> {
    let cap = state.config.limits.inline_error_cap;
    let mut facet = tool_msg
        .tool_call
        .clone()
        .unwrap_or_else(|| unreachable_facet(tool_msg));
    facet.status = CallStatus::Failed;
    facet.completed_at = Some(Utc::now());

    let content = if error.len() < cap {
        facet.error = Some(error.to_owned());
        MessageBody::Text(error.to_owned())
    } else {
        let payload = state.store.append_payload("text/plain", error.as_bytes())?;
        let mut truncated: String = error.chars().take(cap).collect();
        truncated.push('…');
        facet.error = Some(truncated.clone());
        facet.response_payload_id = Some(payload.id);
        MessageBody::Text(truncated)
    };

    let patched = state.store.patch_message(MessagePatch {
        message_id: tool_msg.id.clone(),
        status: Some(MessageStatus::Failed),
        content: Some(content),
        tool_call: Some(facet),
        ..Default::default()
    })?;
    state.events.publish(&patched);
    Ok(())
}

fn unreachable_facet(tool_msg: &MessageRecord) -> ToolCallFacet {
    // Tool messages are only ever appended with a facet; reconstruct a
    // minimal one rather than trusting that invariant with a panic.
    ToolCallFacet {
        op_id: tool_msg.id.clone(),
        tool_name: String::new(),
        arguments: Value::Null,
        status: CallStatus::Running,
        started_at: tool_msg.created_at,
        completed_at: None,
        error: None,
        request_payload_id: None,
        response_payload_id: None,
        trace_id: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum ApprovalEnd {
    Approved,
    Declined(Option<String>),
    Cancelled,
}

async fn request_approval(
    state: &AppState,
    ctx: &TurnContext,
    canonical: &str,
    step: &ToolCall,
) -> Result<ApprovalEnd> {
    let mut prompt = NewMessage::new(
        &ctx.conversation.id,
        MessageRole::Assistant,
        MessageBody::Text(format!("approval required for {canonical}")),
    );
    prompt.turn_id = Some(ctx.turn_id);
    prompt.status = MessageStatus::Open;
    prompt.elicitation = Some(Elicitation {
        message: format!("approval required for {canonical}"),
        requested_schema: serde_json::json!({
            "type": "object",
            "properties": { "approved": { "type": "boolean" } },
            "required": ["approved"]
        }),
        ui: Some(serde_json::json!({
            "kind": "approval",
            "tool": canonical,
            "arguments": step.arguments,
        })),
    });
    let prompt = state.store.append_message(prompt)?;
    let rx = state
        .awaiters
        .register(&prompt.id, &ctx.conversation.id, WaitKind::Approval);
    state.events.publish(&prompt);
    let resolution = await_resolution(state, ctx, &prompt.id, rx).await;

    match resolution {
        Some(Resolution::Accept { .. }) => {
            let done = state.store.patch_message(MessagePatch {
                message_id: prompt.id,
                status: Some(MessageStatus::Done),
                ..Default::default()
            })?;
            state.events.publish(&done);
            Ok(ApprovalEnd::Approved)
        }
        Some(Resolution::Decline { reason }) => {
            let declined = state.store.patch_message(MessagePatch {
                message_id: prompt.id,
                status: Some(MessageStatus::Declined),
                ..Default::default()
            })?;
            state.events.publish(&declined);
            Ok(ApprovalEnd::Declined(reason))
        }
        Some(Resolution::Cancel) | None => {
            state.awaiters.remove_expired(&prompt.id);
            let failed = state.store.patch_message(MessagePatch {
                message_id: prompt.id,
                status: Some(MessageStatus::Failed),
                ..Default::default()
            })?;
            state.events.publish(&failed);
            if ctx.cancel.is_cancelled() {
                Ok(ApprovalEnd::Cancelled)
            } else {
                Ok(ApprovalEnd::Declined(Some("approval timed out".into())))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
