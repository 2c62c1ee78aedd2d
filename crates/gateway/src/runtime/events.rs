//! Event publishing — the sequenced, replayable view of a conversation.
//!
//! Every finalized message commit publishes an envelope `{seq,
//! conversationId, message, contentType?, content?}`. Subscribers follow a
//! conversation either by long-poll (resume cursor `since=<seq>`, bounded
//! wait) or by SSE (optional history replay, then live). Interim deltas are
//! forwarded live with seq 0 and are never part of replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use pv_domain::error::Result;
use pv_transcript::{
    CallStatus, ListFilter, MessageBody, MessageRecord, MessageRole, MessageStatus,
    TranscriptStore,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event types and envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AssistantMessage,
    InterimMessage,
    Elicitation,
    AttachmentLinked,
    ToolCallStarted,
    ToolCallCompleted,
    ToolCallFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::AssistantMessage => "assistant_message",
            EventType::InterimMessage => "interim_message",
            EventType::Elicitation => "elicitation",
            EventType::AttachmentLinked => "attachment_linked",
            EventType::ToolCallStarted => "tool_call_started",
            EventType::ToolCallCompleted => "tool_call_completed",
            EventType::ToolCallFailed => "tool_call_failed",
        }
    }
}

/// The wire envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub seq: u64,
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    pub message: MessageRecord,
    #[serde(rename = "contentType", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// An envelope paired with its derived event type.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    #[serde(skip)]
    pub event: EventType,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// Derive the event type from message role, tool-call status, and
/// elicitation presence.
pub fn event_for(message: &MessageRecord) -> EventType {
    if let Some(tc) = &message.tool_call {
        return match tc.status {
            CallStatus::Running => EventType::ToolCallStarted,
            CallStatus::Completed => EventType::ToolCallCompleted,
            CallStatus::Failed => EventType::ToolCallFailed,
        };
    }
    if message.elicitation.is_some() {
        return EventType::Elicitation;
    }
    if message.interim {
        return EventType::InterimMessage;
    }
    EventType::AssistantMessage
}

fn envelope_for(message: &MessageRecord) -> Envelope {
    let (content_type, content) = match &message.content {
        MessageBody::Text(t) => ("text/plain", t.clone()),
        MessageBody::Structured(v) => {
            ("application/json", serde_json::to_string(v).unwrap_or_default())
        }
    };
    Envelope {
        seq: message.seq,
        conversation_id: message.conversation_id.clone(),
        message: message.clone(),
        content_type: Some(content_type.to_owned()),
        content: Some(content),
    }
}

/// Whether streamed assistant text contains a recognizable elicitation
/// JSON block. Such deltas are suppressed so clients receive one
/// structured `elicitation` event instead of a partial JSON stream.
pub fn contains_elicitation_block(text: &str) -> bool {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    compact.contains(r#""type":"elicitation""#)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Publisher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Channel {
    tx: broadcast::Sender<Outbound>,
    notify: Arc<Notify>,
}

/// Fan-out hub. The subscriber set and per-conversation wakeups are
/// guarded together; the store remains the authority for ordering.
#[derive(Default)]
pub struct EventPublisher {
    channels: Mutex<HashMap<String, Channel>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, conversation_id: &str) -> (broadcast::Sender<Outbound>, Arc<Notify>) {
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(conversation_id.to_owned())
            .or_insert_with(|| Channel {
                tx: broadcast::channel(256).0,
                notify: Arc::new(Notify::new()),
            });
        (channel.tx.clone(), channel.notify.clone())
    }

    /// Subscribe to a conversation's live events.
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<Outbound> {
        self.channel(conversation_id).0.subscribe()
    }

    /// Publish a committed message. Called on every finalized commit and
    /// on tool/elicitation lifecycle transitions.
    pub fn publish(&self, message: &MessageRecord) {
        let event = event_for(message);
        let (tx, notify) = self.channel(&message.conversation_id);

        let outbound = Outbound {
            event,
            envelope: envelope_for(message),
        };
        let _ = tx.send(outbound);

        for attachment in &message.attachments {
            let mut envelope = envelope_for(message);
            envelope.content_type = Some(attachment.mime.clone());
            envelope.content = Some(attachment.payload_id.clone());
            let _ = tx.send(Outbound {
                event: EventType::AttachmentLinked,
                envelope,
            });
        }

        notify.notify_waiters();
    }

    /// Forward a streaming delta as an unsequenced `interim_message`.
    ///
    /// `accumulated` is the full text streamed so far; once it reveals an
    /// elicitation block, the delta is suppressed.
    pub fn publish_interim(
        &self,
        conversation_id: &str,
        message: &MessageRecord,
        delta: &str,
        accumulated: &str,
    ) {
        if contains_elicitation_block(accumulated) {
            return;
        }
        let (tx, _) = self.channel(conversation_id);
        let mut record = message.clone();
        record.content = MessageBody::Text(delta.to_owned());
        record.interim = true;
        let _ = tx.send(Outbound {
            event: EventType::InterimMessage,
            envelope: Envelope {
                seq: 0,
                conversation_id: conversation_id.to_owned(),
                message: record,
                content_type: Some("text/plain".to_owned()),
                content: Some(delta.to_owned()),
            },
        });
    }

    /// Replay finalized envelopes with seq > `since` from the store.
    pub fn replay(
        &self,
        store: &TranscriptStore,
        conversation_id: &str,
        since: u64,
    ) -> Result<Vec<Outbound>> {
        let messages = store.list_messages(
            conversation_id,
            ListFilter {
                since_seq: Some(since),
                include_interim: false,
                include_tool_calls: true,
                ..Default::default()
            },
        )?;
        Ok(messages
            .iter()
            .filter(|m| is_replayable(m))
            .map(|m| Outbound {
                event: event_for(m),
                envelope: envelope_for(m),
            })
            .collect())
    }

    /// Wait up to `wait` for any envelope with seq > `since`. Returns the
    /// batch (possibly empty) and the highest seq seen.
    pub async fn long_poll(
        &self,
        store: &TranscriptStore,
        conversation_id: &str,
        since: u64,
        wait: Duration,
    ) -> Result<(Vec<Outbound>, u64)> {
        let (_, notify) = self.channel(conversation_id);
        let deadline = Instant::now() + wait;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.replay(store, conversation_id, since)?;
            if !batch.is_empty() {
                let max_seq = batch.iter().map(|o| o.envelope.seq).max().unwrap_or(since);
                return Ok((batch, max_seq));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok((Vec::new(), since));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Drop a conversation's channel (called on delete).
    pub fn drop_conversation(&self, conversation_id: &str) {
        self.channels.lock().remove(conversation_id);
    }
}

/// Messages that appear in replay. A still-open prompt replays (the client
/// must see it to answer), but open *running* placeholders do not carry a
/// terminal state and are skipped unless they are tool lifecycle rows.
fn is_replayable(message: &MessageRecord) -> bool {
    if message.tool_call.is_some() || message.elicitation.is_some() {
        return true;
    }
    // Plain messages replay once they are out of `open`, plus user/system
    // rows which commit as done.
    message.status != MessageStatus::Open || message.role == MessageRole::User
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
