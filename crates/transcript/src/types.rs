use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub visibility: Visibility,
    /// Identity subject that created the conversation.
    pub created_by: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Default model in `provider/model` form.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Tool patterns this conversation may use. Empty = everything.
    #[serde(default)]
    pub tool_patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub conversation_id: String,
    /// The user message that initiated the turn.
    pub parent_message_id: String,
    pub status: TurnStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Open,
    Done,
    Declined,
    Failed,
}

/// Message content: plain text or an arbitrary structured value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Structured(serde_json::Value),
}

impl MessageBody {
    pub fn all_text(&self) -> String {
        match self {
            MessageBody::Text(t) => t.clone(),
            MessageBody::Structured(v) => serde_json::to_string(v).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageBody::Text(t) => t.is_empty(),
            MessageBody::Structured(v) => v.is_null(),
        }
    }
}

/// A payload linked to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub payload_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub mime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub role: MessageRole,
    pub content: MessageBody,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Elicitation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallFacet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_call: Option<ModelCallFacet>,
    /// Monotonic within the conversation; assigned at commit, never reused.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    /// 1 = partial/streaming, 0 = finalized. Interim messages are excluded
    /// from history reconstruction but flow on the event stream.
    #[serde(default)]
    pub interim: bool,
    pub status: MessageStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Facets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFacet {
    /// Unique per call.
    pub op_id: String,
    /// Canonical `service/method` name.
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_payload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_payload_id: Option<String>,
    /// Ties successive model responses when the provider supports
    /// continuation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCallFacet {
    pub model: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_payload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_payload_id: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Elicitation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A structured request for additional user input, carried on an assistant
/// message. `requestedSchema` is JSON-schema-shaped with a required list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Elicitation {
    pub message: String,
    #[serde(rename = "requestedSchema")]
    pub requested_schema: serde_json::Value,
    /// Optional UI hints (rendering, kind markers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui: Option<serde_json::Value>,
}

impl Elicitation {
    /// Parse a `{"type":"elicitation", ...}` JSON value.
    pub fn from_value(v: &serde_json::Value) -> Option<Elicitation> {
        if v.get("type").and_then(|t| t.as_str()) != Some("elicitation") {
            return None;
        }
        Some(Elicitation {
            message: v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_owned(),
            requested_schema: v
                .get("requestedSchema")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            ui: v.get("ui").cloned(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payloads and usage rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable payload: inline body up to the configured cap, external file
/// reference above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub id: String,
    pub mime: String,
    /// Base64-encoded inline body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_uri: Option<String>,
    pub size: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub conversation_id: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub embedding_tokens: u64,
    pub cached_tokens: u64,
    pub total_tokens: u64,
}
