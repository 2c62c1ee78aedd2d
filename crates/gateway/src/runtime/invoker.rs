//! Model invocation — one "generate" call with full facet bookkeeping.
//!
//! The invoker appends the assistant message that will carry the ModelCall
//! facet (status `running`) before dispatch, streams the provider response
//! (deltas forwarded as interim events), captures usage through the turn's
//! aggregator, and patches the facet to `completed` or `failed`. The
//! planner finalizes the message afterwards — as an answer, a plan, or an
//! elicitation.

use std::collections::HashMap;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;

use pv_domain::error::{Error, Result};
use pv_domain::stream::{StreamEvent, Usage};
use pv_domain::tool::{ChatMessage, ToolCall, ToolDefinition};
use pv_providers::ChatRequest;
use pv_transcript::{
    CallStatus, MessageBody, MessagePatch, MessageRecord, MessageRole, MessageStatus,
    ModelCallFacet, NewMessage,
};

use crate::state::AppState;

use super::TurnContext;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Binding and outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one model invocation binds: system prompt, filtered history,
/// tool signatures, and the continuation cursor.
pub struct Binding {
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub previous_response_id: Option<String>,
}

/// The parsed result of one invocation, pre-finalization.
pub struct ModelOutcome {
    /// The assistant message carrying the ModelCall facet. Still interim
    /// and open; the planner decides its final shape.
    pub message: MessageRecord,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub response_id: Option<String>,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// generate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one model call for the turn.
pub async fn generate(
    state: &AppState,
    ctx: &TurnContext,
    binding: Binding,
) -> Result<ModelOutcome> {
    // Model precedence: per-turn override → conversation default → fleet
    // default.
    let selection = ctx
        .model
        .clone()
        .or_else(|| ctx.conversation.default_model.clone());
    let (provider, model) = state.providers.resolve(selection.as_deref())?;
    let model_label = format!("{}/{model}", provider.provider_id());

    // Record the prompt as a payload before dispatch.
    let prompt_json = serde_json::to_vec(&serde_json::json!({
        "system": &binding.system_prompt,
        "messages": &binding.history,
        "tools": binding.tools.iter().map(|t| &t.name).collect::<Vec<_>>(),
    }))?;
    let prompt_payload = state.store.append_payload("application/json", &prompt_json)?;

    // The facet goes in running before the provider sees the request.
    let mut new = NewMessage::new(
        &ctx.conversation.id,
        MessageRole::Assistant,
        MessageBody::Text("…".into()),
    );
    new.turn_id = Some(ctx.turn_id);
    new.parent_id = Some(ctx.parent_message_id.clone());
    new.interim = true;
    new.status = MessageStatus::Open;
    new.model_call = Some(ModelCallFacet {
        model: model_label.clone(),
        status: CallStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
        prompt_payload_id: Some(prompt_payload.id.clone()),
        response_payload_id: None,
    });
    let message = state.store.append_message(new)?;

    let mut messages = Vec::with_capacity(binding.history.len() + 1);
    messages.push(ChatMessage::system(&binding.system_prompt));
    messages.extend(binding.history);

    let continuation_allowed =
        state.config.llm.continuation && provider.capabilities().supports_continuation;
    let req = ChatRequest {
        messages,
        tools: binding.tools,
        temperature: Some(0.2),
        max_tokens: None,
        model: Some(model),
        previous_response_id: if continuation_allowed {
            binding.previous_response_id
        } else {
            None
        },
    };

    tracing::debug!(model = %model_label, "model call dispatched");

    let streamed = if provider.capabilities().supports_streaming {
        stream_response(state, ctx, &message, provider.chat_stream(&req).await).await
    } else {
        match provider.chat(&req).await {
            Ok(resp) => Ok(Streamed {
                text: resp.content,
                tool_calls: resp.tool_calls,
                usage: resp.usage,
                finish_reason: resp.finish_reason,
                response_id: resp.response_id,
            }),
            Err(e) => Err(e),
        }
    };

    let streamed = match streamed {
        Ok(s) => s,
        Err(e) => {
            fail_model_call(state, &message, &e);
            return Err(e);
        }
    };

    if let Some(usage) = &streamed.usage {
        ctx.usage.on_usage(&model_label, usage);
    }

    // Record the response payload and complete the facet.
    let response_json = serde_json::to_vec(&serde_json::json!({
        "content": &streamed.text,
        "toolCalls": &streamed.tool_calls,
        "finishReason": &streamed.finish_reason,
    }))?;
    let response_payload = state
        .store
        .append_payload("application/json", &response_json)?;

    let mut facet = message.model_call.clone().unwrap_or(ModelCallFacet {
        model: model_label,
        status: CallStatus::Running,
        started_at: Utc::now(),
        completed_at: None,
        prompt_payload_id: None,
        response_payload_id: None,
    });
    facet.status = CallStatus::Completed;
    facet.completed_at = Some(Utc::now());
    facet.response_payload_id = Some(response_payload.id);
    let message = state.store.patch_message(MessagePatch {
        message_id: message.id.clone(),
        model_call: Some(facet),
        ..Default::default()
    })?;

    Ok(ModelOutcome {
        message,
        text: streamed.text,
        tool_calls: streamed.tool_calls,
        response_id: streamed.response_id,
        finish_reason: streamed.finish_reason,
    })
}

/// Mark the facet (and the carrying message) failed. The error itself
/// surfaces verbatim to the planner.
fn fail_model_call(state: &AppState, message: &MessageRecord, error: &Error) {
    let mut facet = match message.model_call.clone() {
        Some(f) => f,
        None => return,
    };
    facet.status = CallStatus::Failed;
    facet.completed_at = Some(Utc::now());

    let patch = MessagePatch {
        message_id: message.id.clone(),
        status: Some(MessageStatus::Failed),
        interim: Some(false),
        content: Some(MessageBody::Text(error.to_string())),
        model_call: Some(facet),
        ..Default::default()
    };
    match state.store.patch_message(patch) {
        Ok(updated) => state.events.publish(&updated),
        Err(e) => tracing::warn!(error = %e, "failed to record model-call failure"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream consumption
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct Streamed {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    response_id: Option<String>,
}

async fn stream_response(
    state: &AppState,
    ctx: &TurnContext,
    message: &MessageRecord,
    stream: Result<pv_domain::stream::BoxStream<'static, Result<StreamEvent>>>,
) -> Result<Streamed> {
    let mut stream = stream?;

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<Usage> = None;
    let mut finish_reason: Option<String> = None;
    let mut response_id: Option<String> = None;
    // call_id → (name, args buffer); some providers only use start+delta.
    let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();
    let mut tc_order: Vec<String> = Vec::new();

    loop {
        let event = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            next = stream.next() => match next {
                Some(event) => event?,
                None => break,
            },
        };

        match event {
            StreamEvent::Thinking { .. } => {}
            StreamEvent::Token { text: delta } => {
                text.push_str(&delta);
                state
                    .events
                    .publish_interim(&ctx.conversation.id, message, &delta, &text);
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                tc_order.push(call_id.clone());
                tc_bufs.insert(call_id, (tool_name, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                    args.push_str(&delta);
                } else if let Some(last) = tc_order.last() {
                    // Providers that key deltas by index rather than id.
                    if let Some((_, args)) = tc_bufs.get_mut(last) {
                        args.push_str(&delta);
                    }
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                tc_bufs.remove(&call_id);
                tc_order.retain(|id| *id != call_id);
                tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            StreamEvent::Done {
                usage: u,
                finish_reason: fr,
                response_id: rid,
            } => {
                if u.is_some() {
                    usage = u;
                }
                if fr.is_some() {
                    finish_reason = fr;
                }
                if rid.is_some() {
                    response_id = rid;
                }
            }
            StreamEvent::Error { message } => {
                return Err(Error::Provider {
                    provider: "stream".into(),
                    message,
                });
            }
        }
    }

    // Assemble calls that never saw a Finished event.
    for call_id in tc_order {
        if let Some((name, args_str)) = tc_bufs.remove(&call_id) {
            let arguments: Value = if args_str.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&args_str).unwrap_or_else(|e| {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %name,
                        error = %e,
                        "tool call arguments are not valid JSON; defaulting to empty object"
                    );
                    Value::Object(Default::default())
                })
            };
            tool_calls.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }
    }

    Ok(Streamed {
        text,
        tool_calls,
        usage,
        finish_reason,
        response_id,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::runtime::awaiter::AwaiterRegistry;
    use crate::runtime::cancel::{CancelRegistry, CancelToken};
    use crate::runtime::events::{EventPublisher, EventType};
    use crate::runtime::registry::ToolRegistry;
    use crate::runtime::services::ChildRunnerSlot;
    use crate::runtime::ToolPolicy;
    use crate::state::Identity;
    use pv_domain::config::{Config, RegistryConfig};
    use pv_domain::stream::BoxStream;
    use pv_providers::ProviderRegistry;
    use pv_toolserver::ProxyManager;
    use pv_transcript::{NewConversation, TranscriptStore, UsageAggregator};

    fn test_state(dir: &tempfile::TempDir) -> AppState {
        AppState {
            config: Arc::new(Config::default()),
            store: Arc::new(TranscriptStore::new(dir.path(), 1024).unwrap()),
            providers: Arc::new(ProviderRegistry::with_providers(Default::default(), None)),
            tools: Arc::new(ToolRegistry::new(
                RegistryConfig::default(),
                Arc::new(ProxyManager::new(Vec::new())),
            )),
            cancels: Arc::new(CancelRegistry::new()),
            events: Arc::new(EventPublisher::new()),
            awaiters: Arc::new(AwaiterRegistry::new()),
            child_runner: Arc::new(ChildRunnerSlot::new()),
            api_token_hash: None,
            started_at: chrono::Utc::now(),
        }
    }

    fn test_ctx(state: &AppState) -> TurnContext {
        let conversation = state
            .store
            .create_conversation(NewConversation::default())
            .unwrap();
        TurnContext {
            conversation,
            turn_id: uuid::Uuid::new_v4(),
            parent_message_id: "m0".into(),
            identity: Identity::anonymous(),
            cancel: CancelToken::new(),
            usage: Arc::new(UsageAggregator::new()),
            model: None,
            tool_patterns: Vec::new(),
            tool_policy: ToolPolicy::Auto,
            agent: None,
        }
    }

    /// The interim-carrying message; `stream_response` only reads it to
    /// stamp delta envelopes.
    fn carrier(ctx: &TurnContext) -> MessageRecord {
        MessageRecord {
            id: "m1".into(),
            conversation_id: ctx.conversation.id.clone(),
            turn_id: Some(ctx.turn_id),
            parent_id: None,
            role: MessageRole::Assistant,
            content: MessageBody::Text("…".into()),
            attachments: Vec::new(),
            elicitation: None,
            tool_call: None,
            model_call: None,
            seq: 0,
            created_at: chrono::Utc::now(),
            interim: true,
            status: MessageStatus::Open,
        }
    }

    fn scripted(events: Vec<StreamEvent>) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        Ok(Box::pin(futures_util::stream::iter(
            events.into_iter().map(Ok),
        )))
    }

    fn done(response_id: Option<&str>) -> StreamEvent {
        StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
            response_id: response_id.map(String::from),
        }
    }

    #[tokio::test]
    async fn tokens_accumulate_and_flow_as_interim_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let ctx = test_ctx(&state);
        let mut rx = state.events.subscribe(&ctx.conversation.id);
        let message = carrier(&ctx);

        let streamed = stream_response(
            &state,
            &ctx,
            &message,
            scripted(vec![
                StreamEvent::Token { text: "Hel".into() },
                StreamEvent::Token { text: "lo".into() },
                StreamEvent::Done {
                    usage: Some(Usage {
                        prompt_tokens: 3,
                        completion_tokens: 2,
                        total_tokens: 5,
                        ..Default::default()
                    }),
                    finish_reason: Some("stop".into()),
                    response_id: Some("r1".into()),
                },
            ]),
        )
        .await
        .unwrap();

        assert_eq!(streamed.text, "Hello");
        assert!(streamed.tool_calls.is_empty());
        assert_eq!(streamed.usage.unwrap().total_tokens, 5);
        assert_eq!(streamed.response_id.as_deref(), Some("r1"));
        assert_eq!(streamed.finish_reason.as_deref(), Some("stop"));

        // Each token flowed as an unsequenced interim delta.
        let first = rx.try_recv().unwrap();
        assert_eq!(first.event, EventType::InterimMessage);
        assert_eq!(first.envelope.seq, 0);
        assert_eq!(first.envelope.content.as_deref(), Some("Hel"));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.envelope.content.as_deref(), Some("lo"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn index_keyed_deltas_attach_to_the_last_started_call() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let ctx = test_ctx(&state);
        let message = carrier(&ctx);

        // Chat-completions style: started by call id, deltas by choice
        // index, no ToolCallFinished.
        let streamed = stream_response(
            &state,
            &ctx,
            &message,
            scripted(vec![
                StreamEvent::ToolCallStarted {
                    call_id: "call_9".into(),
                    tool_name: "db/ping".into(),
                },
                StreamEvent::ToolCallDelta {
                    call_id: "0".into(),
                    delta: "{\"x\":".into(),
                },
                StreamEvent::ToolCallDelta {
                    call_id: "0".into(),
                    delta: "1}".into(),
                },
                done(None),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(streamed.tool_calls.len(), 1);
        assert_eq!(streamed.tool_calls[0].call_id, "call_9");
        assert_eq!(streamed.tool_calls[0].tool_name, "db/ping");
        assert_eq!(streamed.tool_calls[0].arguments, serde_json::json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn finished_event_wins_over_buffered_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let ctx = test_ctx(&state);
        let message = carrier(&ctx);

        let streamed = stream_response(
            &state,
            &ctx,
            &message,
            scripted(vec![
                StreamEvent::ToolCallStarted {
                    call_id: "call_1".into(),
                    tool_name: "db/ping".into(),
                },
                StreamEvent::ToolCallDelta {
                    call_id: "call_1".into(),
                    delta: "{\"partial\"".into(),
                },
                StreamEvent::ToolCallFinished {
                    call_id: "call_1".into(),
                    tool_name: "db/ping".into(),
                    arguments: serde_json::json!({ "a": 1 }),
                },
                done(None),
            ]),
        )
        .await
        .unwrap();

        // One call, with the finished arguments — the buffer is dropped,
        // not assembled into a duplicate.
        assert_eq!(streamed.tool_calls.len(), 1);
        assert_eq!(streamed.tool_calls[0].arguments, serde_json::json!({ "a": 1 }));
    }

    #[tokio::test]
    async fn malformed_arguments_default_to_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let ctx = test_ctx(&state);
        let message = carrier(&ctx);

        let streamed = stream_response(
            &state,
            &ctx,
            &message,
            scripted(vec![
                StreamEvent::ToolCallStarted {
                    call_id: "call_1".into(),
                    tool_name: "db/ping".into(),
                },
                StreamEvent::ToolCallDelta {
                    call_id: "call_1".into(),
                    delta: "not json".into(),
                },
                StreamEvent::ToolCallStarted {
                    call_id: "call_2".into(),
                    tool_name: "db/query".into(),
                },
                done(None),
            ]),
        )
        .await
        .unwrap();

        // Unparseable and empty buffers both fall back to {}.
        assert_eq!(streamed.tool_calls.len(), 2);
        for call in &streamed.tool_calls {
            assert_eq!(call.arguments, serde_json::json!({}));
        }
    }

    #[tokio::test]
    async fn error_event_surfaces_as_provider_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let ctx = test_ctx(&state);
        let message = carrier(&ctx);

        let err = stream_response(
            &state,
            &ctx,
            &message,
            scripted(vec![
                StreamEvent::Token { text: "par".into() },
                StreamEvent::Error {
                    message: "upstream exploded".into(),
                },
            ]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Provider { .. }), "{err}");
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let ctx = test_ctx(&state);
        let message = carrier(&ctx);
        ctx.cancel.cancel();

        // A stream that never yields: only the cancel arm can win.
        let pending: Result<BoxStream<'static, Result<StreamEvent>>> =
            Ok(Box::pin(futures_util::stream::pending()));
        let err = stream_response(&state, &ctx, &message, pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
