//! The turn runtime: orchestration, planning, tool dispatch, events,
//! cancellation, and interactive awaiters.
//!
//! [`accept`] is the public entry point: it records the user message,
//! starts the turn on a detached task governed by the cancel registry, and
//! returns the assigned ids immediately. All further progress is
//! observable through the event stream.

pub mod awaiter;
pub mod cancel;
pub mod events;
pub mod invoker;
pub mod monitor;
pub mod registry;
pub mod services;
pub mod stage;
mod turn;

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use pv_domain::config::AgentConfig;
use pv_domain::error::{Error, Result};
use pv_transcript::{
    Conversation, MessageBody, MessageRole, MessageStatus, NewConversation, NewMessage,
    TurnStatus, UsageAggregator,
};

use crate::state::{AppState, Identity};

use cancel::CancelToken;
use registry::CallContext;
use services::ChildRunner;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-turn tool policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPolicy {
    #[default]
    Auto,
    Ask,
    Deny,
}

/// Everything a running turn carries.
pub struct TurnContext {
    pub conversation: Conversation,
    pub turn_id: Uuid,
    /// The user message that initiated the turn.
    pub parent_message_id: String,
    pub identity: Identity,
    pub cancel: CancelToken,
    pub usage: Arc<UsageAggregator>,
    /// Per-turn model override (`provider/model`).
    pub model: Option<String>,
    /// Per-turn tool patterns; empty falls back to the conversation's.
    pub tool_patterns: Vec<String>,
    pub tool_policy: ToolPolicy,
    pub agent: Option<AgentConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Accept
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A user query entering the engine.
pub struct AcceptQuery {
    /// Existing conversation, or `None` to create one.
    pub conversation_id: Option<String>,
    pub content: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub tool_policy: ToolPolicy,
    pub identity: Identity,
}

/// Ids assigned at accept time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Accepted {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(rename = "turnId")]
    pub turn_id: Uuid,
    pub id: String,
}

/// Accept a user query: record the message, start the turn, return. The
/// planner loop continues asynchronously under the cancel registry.
pub async fn accept(state: &AppState, query: AcceptQuery) -> Result<Accepted> {
    if query.content.trim().is_empty() {
        return Err(Error::Validation("message content is empty".into()));
    }

    let agent = resolve_agent(state, query.agent.as_deref())?;

    let conversation = match &query.conversation_id {
        Some(id) => state.store.get_conversation(id)?,
        None => state.store.create_conversation(NewConversation {
            title: truncate(&query.content, 64),
            created_by: query.identity.subject.clone(),
            agent_id: agent.as_ref().map(|a| a.id.clone()),
            default_model: query.model.clone(),
            ..Default::default()
        })?,
    };

    // One running turn per conversation; overlapping starts reject early.
    if !state.store.running_turns(&conversation.id).is_empty() {
        return Err(Error::Conflict(format!(
            "conversation {} already has a running turn",
            conversation.id
        )));
    }

    let mut user = NewMessage::new(
        &conversation.id,
        MessageRole::User,
        MessageBody::Text(query.content.clone()),
    );
    user.status = MessageStatus::Done;
    let user = state.store.append_message(user)?;
    state.events.publish(&user);

    let turn = state.store.create_turn(&conversation.id, &user.id)?;

    let cancel = CancelToken::new();
    state
        .cancels
        .register(&conversation.id, turn.id, cancel.clone());

    let agent = agent.or_else(|| resolve_agent(state, conversation.agent_id.as_deref()).ok().flatten());
    let ctx = TurnContext {
        conversation: conversation.clone(),
        turn_id: turn.id,
        parent_message_id: user.id.clone(),
        identity: query.identity,
        cancel,
        usage: Arc::new(UsageAggregator::new()),
        model: query.model,
        tool_patterns: query.tools,
        tool_policy: query.tool_policy,
        agent,
    };

    let span = tracing::info_span!(
        "turn",
        conversation_id = %conversation.id,
        turn_id = %turn.id,
    );
    let task_state = state.clone();
    tokio::spawn(tracing::Instrument::instrument(
        async move {
            run_turn_task(task_state, ctx).await;
        },
        span,
    ));

    Ok(Accepted {
        conversation_id: conversation.id,
        turn_id: turn.id,
        id: user.id,
    })
}

fn resolve_agent(state: &AppState, agent_id: Option<&str>) -> Result<Option<AgentConfig>> {
    match agent_id {
        None => Ok(None),
        Some(id) => state
            .config
            .agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .map(Some)
            .ok_or_else(|| Error::NotFound(format!("agent '{id}'"))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn_task(state: AppState, ctx: TurnContext) {
    tracing::debug!("turn started");
    let result = turn::run_planner_loop(&state, &ctx).await;
    finalize_turn(&state, &ctx, result);
}

/// Write the terminal turn state: status, usage flush, cancel-handle
/// removal, and — when the failure is not yet visible — a terminal
/// failure message.
fn finalize_turn(state: &AppState, ctx: &TurnContext, result: Result<TurnStatus>) -> TurnStatus {
    let status = match result {
        Ok(status) => status,
        Err(Error::Cancelled) => TurnStatus::Cancelled,
        Err(e) => {
            tracing::warn!(error = %e, "turn failed");
            let mut terminal = NewMessage::new(
                &ctx.conversation.id,
                MessageRole::Assistant,
                MessageBody::Text(format!("turn failed: {e}")),
            );
            terminal.turn_id = Some(ctx.turn_id);
            terminal.status = MessageStatus::Failed;
            match state.store.append_message(terminal) {
                Ok(m) => state.events.publish(&m),
                Err(e) => tracing::error!(error = %e, "failed to record terminal message"),
            }
            TurnStatus::Failed
        }
    };

    if let Err(e) = ctx.usage.flush(&state.store, &ctx.conversation.id) {
        tracing::warn!(error = %e, "failed to flush usage");
    }
    if let Err(e) = state.store.finish_turn(ctx.turn_id, status) {
        tracing::warn!(error = %e, "failed to finalize turn");
    }
    state
        .cancels
        .complete(&ctx.conversation.id, ctx.turn_id, &ctx.cancel);
    status
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child conversations (agent/run)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The orchestrator's implementation of the `agent/run` capability: run a
/// child conversation to completion and return its final answer. The
/// parent's cancellation cascades into the child.
pub struct OrchestratorRunner {
    state: AppState,
}

impl OrchestratorRunner {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl ChildRunner for OrchestratorRunner {
    async fn run_child(
        &self,
        ctx: &CallContext,
        agent_id: Option<&str>,
        task: &str,
        model: Option<&str>,
    ) -> Result<String> {
        let state = &self.state;
        let agent = resolve_agent(state, agent_id)?;

        let conversation = state.store.create_conversation(NewConversation {
            title: format!("agent: {}", agent_id.unwrap_or("default")),
            created_by: format!("agent:{}", ctx.conversation_id),
            agent_id: agent.as_ref().map(|a| a.id.clone()),
            default_model: model
                .map(String::from)
                .or_else(|| agent.as_ref().and_then(|a| a.model.clone())),
            tool_patterns: agent.as_ref().map(|a| a.tools.clone()).unwrap_or_default(),
            ..Default::default()
        })?;

        let mut user = NewMessage::new(
            &conversation.id,
            MessageRole::User,
            MessageBody::Text(task.to_owned()),
        );
        user.status = MessageStatus::Done;
        let user = state.store.append_message(user)?;
        state.events.publish(&user);

        let turn = state.store.create_turn(&conversation.id, &user.id)?;
        let child_cancel = CancelToken::new();
        state
            .cancels
            .register(&conversation.id, turn.id, child_cancel.clone());

        let child_ctx = TurnContext {
            conversation: conversation.clone(),
            turn_id: turn.id,
            parent_message_id: user.id,
            identity: Identity {
                subject: format!("agent:{}", ctx.conversation_id),
                bearer: ctx.bearer.clone(),
            },
            cancel: child_cancel.clone(),
            usage: Arc::new(UsageAggregator::new()),
            model: model.map(String::from),
            tool_patterns: Vec::new(),
            tool_policy: ToolPolicy::Auto,
            agent,
        };

        // Run inline so the parent step reflects the child's duration.
        // A parent cancel cascades: signal the child, then let its loop
        // unwind cooperatively.
        let loop_fut = turn::run_planner_loop(state, &child_ctx);
        tokio::pin!(loop_fut);
        let result = tokio::select! {
            r = &mut loop_fut => r,
            _ = ctx.cancel.cancelled() => {
                child_ctx.cancel.cancel();
                loop_fut.await
            }
        };

        let status = finalize_turn(state, &child_ctx, result);
        match status {
            TurnStatus::Succeeded => {
                let answer = state
                    .store
                    .normalized_transcript(&conversation.id)?
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::Assistant)
                    .map(|m| m.content.all_text())
                    .unwrap_or_default();
                Ok(answer)
            }
            TurnStatus::Cancelled => Err(Error::Cancelled),
            other => Err(Error::Permanent(format!(
                "agent run ended with status {other:?}"
            ))),
        }
    }
}
