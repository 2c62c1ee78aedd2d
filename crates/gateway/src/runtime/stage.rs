//! Stage tracking — classifies a conversation's live state from the
//! transcript tail.

use serde::Serialize;

use pv_transcript::{CallStatus, MessageRecord, MessageRole, MessageStatus};

/// The live phase of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Waiting,
    Thinking,
    Executing,
    Eliciting,
    Done,
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Waiting => "waiting",
            Phase::Thinking => "thinking",
            Phase::Executing => "executing",
            Phase::Eliciting => "eliciting",
            Phase::Done => "done",
            Phase::Error => "error",
        }
    }
}

/// Compute the current phase from a conversation's messages (in sequence
/// order, interim included).
pub fn compute(messages: &[MessageRecord]) -> Phase {
    if messages.is_empty() {
        return Phase::Waiting;
    }

    // executing: a tool call is still in flight.
    let executing = messages.iter().rev().any(|m| {
        m.tool_call.as_ref().is_some_and(|tc| {
            tc.status == CallStatus::Running || tc.completed_at.is_none()
        })
    });
    if executing {
        return Phase::Executing;
    }

    // eliciting: the latest assistant message is an open prompt.
    let latest_assistant = messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant && !m.interim);
    if let Some(m) = latest_assistant {
        if m.elicitation.is_some() && m.status == MessageStatus::Open {
            return Phase::Eliciting;
        }
    }

    // thinking: a model call is running, or the user spoke last.
    let model_running = messages
        .iter()
        .rev()
        .find_map(|m| m.model_call.as_ref())
        .is_some_and(|mc| mc.status == CallStatus::Running);
    let latest_final = messages.iter().rev().find(|m| !m.interim);
    let user_unanswered = latest_final.is_some_and(|m| m.role == MessageRole::User);
    if model_running || user_unanswered {
        return Phase::Thinking;
    }

    // error: the latest finalized message is itself a failure…
    if latest_final.is_some_and(|m| m.status == MessageStatus::Failed) {
        return Phase::Error;
    }

    // …or the latest tool failure has no newer assistant success.
    let last_failed_tool_seq = messages
        .iter()
        .rev()
        .find(|m| m.tool_call.as_ref().is_some_and(|tc| tc.status == CallStatus::Failed))
        .map(|m| m.seq);
    if let Some(failed_seq) = last_failed_tool_seq {
        let recovered = messages.iter().any(|m| {
            m.seq > failed_seq
                && m.role == MessageRole::Assistant
                && !m.interim
                && m.status != MessageStatus::Failed
        });
        if !recovered {
            return Phase::Error;
        }
    }

    Phase::Done
}
