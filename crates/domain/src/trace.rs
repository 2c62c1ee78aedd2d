use serde::Serialize;

/// Structured trace events emitted across all Palaver crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ConversationCreated {
        conversation_id: String,
        visibility: String,
    },
    TurnStarted {
        conversation_id: String,
        turn_id: String,
    },
    TurnFinished {
        conversation_id: String,
        turn_id: String,
        status: String,
        duration_ms: u64,
    },
    MessageCommitted {
        conversation_id: String,
        message_id: String,
        seq: u64,
        role: String,
    },
    ToolDispatched {
        conversation_id: String,
        tool_name: String,
        server: Option<String>,
        duration_ms: u64,
        is_error: bool,
        memo_hit: bool,
    },
    CatalogRefreshed {
        server: String,
        tool_count: usize,
    },
    ProxyReconnected {
        server: String,
        attempt: u32,
    },
    ElicitationResolved {
        message_id: String,
        action: String,
    },
    UsageFlushed {
        conversation_id: String,
        models: usize,
        total_tokens: u64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "pv_event");
    }
}
