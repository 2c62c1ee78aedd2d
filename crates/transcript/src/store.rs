//! The transcript store — the single authority for conversation state and
//! message ordering.
//!
//! All writers go through here. Appends to one conversation serialize
//! through that conversation's lock so sequence numbers are assigned in
//! commit order; reads are point-in-time snapshots. State is persisted
//! under the configured directory: a `conversations.json` / `turns.json`
//! snapshot, one append-only `transcripts/<id>.jsonl` per conversation,
//! `payloads.jsonl` for payload metadata, and `usage.jsonl` for usage rows.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pv_domain::error::{Error, Result};
use pv_domain::trace::TraceEvent;

use crate::types::*;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters for a new conversation.
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub title: String,
    pub visibility: Visibility,
    pub created_by: String,
    pub agent_id: Option<String>,
    pub default_model: Option<String>,
    pub tool_patterns: Vec<String>,
}

/// Parameters for a message append. The store assigns id, seq and
/// created-at.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub turn_id: Option<Uuid>,
    pub parent_id: Option<String>,
    pub role: MessageRole,
    pub content: MessageBody,
    pub attachments: Vec<Attachment>,
    pub elicitation: Option<Elicitation>,
    pub tool_call: Option<ToolCallFacet>,
    pub model_call: Option<ModelCallFacet>,
    pub interim: bool,
    pub status: MessageStatus,
}

impl NewMessage {
    pub fn new(conversation_id: impl Into<String>, role: MessageRole, content: MessageBody) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn_id: None,
            parent_id: None,
            role,
            content,
            attachments: Vec::new(),
            elicitation: None,
            tool_call: None,
            model_call: None,
            interim: false,
            status: MessageStatus::Done,
        }
    }
}

/// A partial update to a committed message. Status may only transition
/// `open → done | declined | failed`; facets and content may be finalized
/// alongside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePatch {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interim: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<Elicitation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallFacet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_call: Option<ModelCallFacet>,
}

/// Filters for message listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub turn_id: Option<Uuid>,
    pub since_seq: Option<u64>,
    pub include_interim: bool,
    pub include_tool_calls: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transcript lines (on-disk)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "line")]
enum TranscriptLine {
    #[serde(rename = "message")]
    Message(MessageRecord),
    #[serde(rename = "patch")]
    Patch(MessagePatch),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-conversation message state, guarded by its own lock so appends to
/// different conversations never contend.
struct ConvState {
    messages: Vec<MessageRecord>,
    next_seq: u64,
}

pub struct TranscriptStore {
    state_dir: PathBuf,
    inline_payload_cap: usize,
    conversations: RwLock<HashMap<String, Conversation>>,
    turns: RwLock<HashMap<Uuid, Turn>>,
    /// conversation id → turn ids, in creation order.
    conv_turns: RwLock<HashMap<String, Vec<Uuid>>>,
    messages: RwLock<HashMap<String, Arc<Mutex<ConvState>>>>,
    /// message id → conversation id, for id-only lookups.
    message_index: RwLock<HashMap<String, String>>,
    payloads: RwLock<HashMap<String, PayloadRecord>>,
    usage: RwLock<Vec<UsageRow>>,
}

impl TranscriptStore {
    /// Open (or create) a store rooted at `state_dir`, replaying any
    /// persisted conversations.
    pub fn new(state_dir: &Path, inline_payload_cap: usize) -> Result<Self> {
        std::fs::create_dir_all(state_dir.join("transcripts")).map_err(Error::Io)?;
        std::fs::create_dir_all(state_dir.join("payloads")).map_err(Error::Io)?;

        let store = Self {
            state_dir: state_dir.to_path_buf(),
            inline_payload_cap,
            conversations: RwLock::new(HashMap::new()),
            turns: RwLock::new(HashMap::new()),
            conv_turns: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            message_index: RwLock::new(HashMap::new()),
            payloads: RwLock::new(HashMap::new()),
            usage: RwLock::new(Vec::new()),
        };
        store.load()?;
        Ok(store)
    }

    // ── Loading ──────────────────────────────────────────────────────

    fn load(&self) -> Result<()> {
        let conv_path = self.state_dir.join("conversations.json");
        if conv_path.exists() {
            let raw = std::fs::read_to_string(&conv_path).map_err(Error::Io)?;
            let convs: HashMap<String, Conversation> =
                serde_json::from_str(&raw).unwrap_or_default();
            for id in convs.keys() {
                self.replay_transcript(id)?;
            }
            *self.conversations.write() = convs;
        }

        let turns_path = self.state_dir.join("turns.json");
        if turns_path.exists() {
            let raw = std::fs::read_to_string(&turns_path).map_err(Error::Io)?;
            let turns: HashMap<Uuid, Turn> = serde_json::from_str(&raw).unwrap_or_default();
            let mut conv_turns: HashMap<String, Vec<Uuid>> = HashMap::new();
            for turn in turns.values() {
                conv_turns
                    .entry(turn.conversation_id.clone())
                    .or_default()
                    .push(turn.id);
            }
            // Order by start time so "latest turn" queries stay cheap.
            for ids in conv_turns.values_mut() {
                ids.sort_by_key(|id| turns.get(id).map(|t| t.started_at));
            }
            *self.turns.write() = turns;
            *self.conv_turns.write() = conv_turns;
        }

        let payloads_path = self.state_dir.join("payloads.jsonl");
        if payloads_path.exists() {
            let raw = std::fs::read_to_string(&payloads_path).map_err(Error::Io)?;
            let mut payloads = self.payloads.write();
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<PayloadRecord>(line) {
                    Ok(p) => {
                        payloads.insert(p.id.clone(), p);
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping malformed payload line"),
                }
            }
        }

        let usage_path = self.state_dir.join("usage.jsonl");
        if usage_path.exists() {
            let raw = std::fs::read_to_string(&usage_path).map_err(Error::Io)?;
            let mut usage = self.usage.write();
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<UsageRow>(line) {
                    Ok(row) => usage.push(row),
                    Err(e) => tracing::warn!(error = %e, "skipping malformed usage line"),
                }
            }
        }

        Ok(())
    }

    fn replay_transcript(&self, conversation_id: &str) -> Result<()> {
        let path = self.transcript_path(conversation_id);
        let mut state = ConvState {
            messages: Vec::new(),
            next_seq: 1,
        };

        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<TranscriptLine>(line) {
                    Ok(TranscriptLine::Message(m)) => {
                        state.next_seq = state.next_seq.max(m.seq + 1);
                        state.messages.push(m);
                    }
                    Ok(TranscriptLine::Patch(p)) => {
                        if let Some(m) =
                            state.messages.iter_mut().find(|m| m.id == p.message_id)
                        {
                            apply_patch(m, &p);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            conversation_id,
                            error = %e,
                            "skipping malformed transcript line"
                        );
                    }
                }
            }
        }

        {
            let mut index = self.message_index.write();
            for m in &state.messages {
                index.insert(m.id.clone(), conversation_id.to_owned());
            }
        }
        self.messages
            .write()
            .insert(conversation_id.to_owned(), Arc::new(Mutex::new(state)));
        Ok(())
    }

    // ── Conversations ────────────────────────────────────────────────

    pub fn create_conversation(&self, params: NewConversation) -> Result<Conversation> {
        let conv = Conversation {
            id: Uuid::new_v4().to_string(),
            title: params.title,
            visibility: params.visibility,
            created_by: params.created_by,
            agent_id: params.agent_id,
            default_model: params.default_model,
            tool_patterns: params.tool_patterns,
            created_at: Utc::now(),
            archived: false,
        };

        self.conversations
            .write()
            .insert(conv.id.clone(), conv.clone());
        self.messages.write().insert(
            conv.id.clone(),
            Arc::new(Mutex::new(ConvState {
                messages: Vec::new(),
                next_seq: 1,
            })),
        );
        self.persist_conversations()?;

        TraceEvent::ConversationCreated {
            conversation_id: conv.id.clone(),
            visibility: format!("{:?}", conv.visibility).to_lowercase(),
        }
        .emit();

        Ok(conv)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Conversation> {
        self.conversations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("conversation {id}")))
    }

    pub fn list_conversations(&self, include_archived: bool) -> Vec<Conversation> {
        let mut out: Vec<Conversation> = self
            .conversations
            .read()
            .values()
            .filter(|c| include_archived || !c.archived)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        out
    }

    pub fn set_archived(&self, id: &str, archived: bool) -> Result<()> {
        {
            let mut convs = self.conversations.write();
            let conv = convs
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
            conv.archived = archived;
        }
        self.persist_conversations()
    }

    pub fn delete_conversation(&self, id: &str) -> Result<()> {
        if self.conversations.write().remove(id).is_none() {
            return Err(Error::NotFound(format!("conversation {id}")));
        }
        self.messages.write().remove(id);
        self.message_index.write().retain(|_, conv| conv.as_str() != id);
        let removed: Vec<Uuid> = self.conv_turns.write().remove(id).unwrap_or_default();
        {
            let mut turns = self.turns.write();
            for tid in removed {
                turns.remove(&tid);
            }
        }
        self.usage.write().retain(|row| row.conversation_id != id);
        let _ = std::fs::remove_file(self.transcript_path(id));
        self.persist_conversations()?;
        self.persist_turns()
    }

    // ── Turns ────────────────────────────────────────────────────────

    /// Create a turn in `running` state. At most one turn per conversation
    /// may be running; a second start is a conflict.
    pub fn create_turn(&self, conversation_id: &str, parent_message_id: &str) -> Result<Turn> {
        self.get_conversation(conversation_id)?;

        let mut turns = self.turns.write();
        let mut conv_turns = self.conv_turns.write();
        let existing = conv_turns
            .entry(conversation_id.to_owned())
            .or_default();

        if existing
            .iter()
            .any(|tid| turns.get(tid).is_some_and(|t| t.status == TurnStatus::Running))
        {
            return Err(Error::Conflict(format!(
                "conversation {conversation_id} already has a running turn"
            )));
        }

        let turn = Turn {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_owned(),
            parent_message_id: parent_message_id.to_owned(),
            status: TurnStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
        };
        existing.push(turn.id);
        turns.insert(turn.id, turn.clone());
        drop(conv_turns);
        drop(turns);

        self.persist_turns()?;
        TraceEvent::TurnStarted {
            conversation_id: conversation_id.to_owned(),
            turn_id: turn.id.to_string(),
        }
        .emit();
        Ok(turn)
    }

    pub fn get_turn(&self, turn_id: Uuid) -> Result<Turn> {
        self.turns
            .read()
            .get(&turn_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("turn {turn_id}")))
    }

    /// Finalize a turn exactly once.
    pub fn finish_turn(&self, turn_id: Uuid, status: TurnStatus) -> Result<Turn> {
        let turn = {
            let mut turns = self.turns.write();
            let turn = turns
                .get_mut(&turn_id)
                .ok_or_else(|| Error::NotFound(format!("turn {turn_id}")))?;
            if turn.status.is_terminal() {
                return Err(Error::Conflict(format!("turn {turn_id} already finalized")));
            }
            turn.status = status;
            turn.ended_at = Some(Utc::now());
            turn.clone()
        };
        self.persist_turns()?;

        let duration_ms = turn
            .ended_at
            .map(|e| (e - turn.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        TraceEvent::TurnFinished {
            conversation_id: turn.conversation_id.clone(),
            turn_id: turn.id.to_string(),
            status: format!("{:?}", turn.status).to_lowercase(),
            duration_ms,
        }
        .emit();
        Ok(turn)
    }

    /// Ids of turns currently running in a conversation.
    pub fn running_turns(&self, conversation_id: &str) -> Vec<Uuid> {
        let turns = self.turns.read();
        self.conv_turns
            .read()
            .get(conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter(|tid| {
                        turns
                            .get(tid)
                            .is_some_and(|t| t.status == TurnStatus::Running)
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Append a message, assigning the next sequence atomically under the
    /// conversation's lock.
    pub fn append_message(&self, new: NewMessage) -> Result<MessageRecord> {
        let state = self.conv_state(&new.conversation_id)?;
        let mut state = state.lock();

        let seq = state.next_seq;
        // A collision here means the lock discipline is broken. Nothing
        // downstream can be trusted after that.
        if let Some(last) = state.messages.last() {
            if seq <= last.seq {
                return Err(Error::Fatal(format!(
                    "sequence collision in conversation {}: next {seq} <= last {}",
                    new.conversation_id, last.seq
                )));
            }
        }
        state.next_seq += 1;

        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: new.conversation_id.clone(),
            turn_id: new.turn_id,
            parent_id: new.parent_id,
            role: new.role,
            content: new.content,
            attachments: new.attachments,
            elicitation: new.elicitation,
            tool_call: new.tool_call,
            model_call: new.model_call,
            seq,
            created_at: Utc::now(),
            interim: new.interim,
            status: new.status,
        };

        self.append_line(
            &new.conversation_id,
            &TranscriptLine::Message(record.clone()),
        )?;
        state.messages.push(record.clone());
        drop(state);

        self.message_index
            .write()
            .insert(record.id.clone(), record.conversation_id.clone());

        TraceEvent::MessageCommitted {
            conversation_id: record.conversation_id.clone(),
            message_id: record.id.clone(),
            seq: record.seq,
            role: record.role.as_str().to_owned(),
        }
        .emit();
        Ok(record)
    }

    /// Apply a patch to a committed message. Returns the updated record.
    pub fn patch_message(&self, patch: MessagePatch) -> Result<MessageRecord> {
        let conversation_id = self.conversation_of(&patch.message_id)?;
        let state = self.conv_state(&conversation_id)?;
        let mut state = state.lock();

        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == patch.message_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", patch.message_id)))?;

        if let Some(next) = patch.status {
            if message.status != MessageStatus::Open && message.status != next {
                return Err(Error::Conflict(format!(
                    "message {} is already {:?}",
                    message.id, message.status
                )));
            }
        }

        apply_patch(message, &patch);
        let updated = message.clone();
        self.append_line(&conversation_id, &TranscriptLine::Patch(patch))?;
        Ok(updated)
    }

    /// Look up the conversation a message belongs to.
    pub fn conversation_of(&self, message_id: &str) -> Result<String> {
        self.message_index
            .read()
            .get(message_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))
    }

    pub fn get_message(&self, message_id: &str) -> Result<MessageRecord> {
        let conversation_id = self.conversation_of(message_id)?;
        let state = self.conv_state(&conversation_id)?;
        let state = state.lock();
        state
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("message {message_id}")))
    }

    pub fn list_messages(
        &self,
        conversation_id: &str,
        filter: ListFilter,
    ) -> Result<Vec<MessageRecord>> {
        let state = self.conv_state(conversation_id)?;
        let state = state.lock();
        Ok(state
            .messages
            .iter()
            .filter(|m| filter.turn_id.is_none_or(|t| m.turn_id == Some(t)))
            .filter(|m| filter.since_seq.is_none_or(|s| m.seq > s))
            .filter(|m| filter.include_interim || !m.interim)
            .filter(|m| filter.include_tool_calls || m.role != MessageRole::Tool)
            .cloned()
            .collect())
    }

    /// The history used to rebuild model bindings: finalized messages only,
    /// with resolved elicitation prompts dropped (the reply carries the
    /// answer).
    pub fn normalized_transcript(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let state = self.conv_state(conversation_id)?;
        let state = state.lock();
        Ok(state
            .messages
            .iter()
            .filter(|m| !m.interim)
            .filter(|m| m.elicitation.is_none() || m.status == MessageStatus::Open)
            .cloned()
            .collect())
    }

    /// The last committed sequence in a conversation (0 when empty).
    pub fn last_seq(&self, conversation_id: &str) -> Result<u64> {
        let state = self.conv_state(conversation_id)?;
        let state = state.lock();
        Ok(state.messages.last().map(|m| m.seq).unwrap_or(0))
    }

    // ── Payloads ─────────────────────────────────────────────────────

    /// Store an immutable payload. Bodies above the inline cap land in a
    /// file and are stored by reference only.
    pub fn append_payload(&self, mime: &str, body: &[u8]) -> Result<PayloadRecord> {
        let id = Uuid::new_v4().to_string();
        let record = if body.len() <= self.inline_payload_cap {
            PayloadRecord {
                id: id.clone(),
                mime: mime.to_owned(),
                inline: Some(base64::engine::general_purpose::STANDARD.encode(body)),
                external_uri: None,
                size: body.len(),
                created_at: Utc::now(),
            }
        } else {
            let path = self.state_dir.join("payloads").join(&id);
            std::fs::write(&path, body).map_err(Error::Io)?;
            PayloadRecord {
                id: id.clone(),
                mime: mime.to_owned(),
                inline: None,
                external_uri: Some(path.to_string_lossy().into_owned()),
                size: body.len(),
                created_at: Utc::now(),
            }
        };

        self.append_jsonl("payloads.jsonl", &record)?;
        self.payloads.write().insert(id, record.clone());
        Ok(record)
    }

    pub fn get_payload(&self, id: &str) -> Result<(PayloadRecord, Vec<u8>)> {
        let record = self
            .payloads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("payload {id}")))?;

        let body = if let Some(inline) = &record.inline {
            base64::engine::general_purpose::STANDARD
                .decode(inline)
                .map_err(|e| Error::Fatal(format!("corrupt inline payload {id}: {e}")))?
        } else if let Some(uri) = &record.external_uri {
            std::fs::read(uri).map_err(Error::Io)?
        } else {
            Vec::new()
        };
        Ok((record, body))
    }

    // ── Usage rows ───────────────────────────────────────────────────

    /// Record a usage row. Rows are append-only; the aggregate for a
    /// (conversation, model) is the sum over its rows.
    pub fn add_usage(&self, row: UsageRow) -> Result<()> {
        self.append_jsonl("usage.jsonl", &row)?;
        self.usage.write().push(row);
        Ok(())
    }

    pub fn usage_for(&self, conversation_id: &str) -> Vec<UsageRow> {
        self.usage
            .read()
            .iter()
            .filter(|row| row.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Summed usage per (provider, model) for a conversation.
    pub fn usage_totals(&self, conversation_id: &str) -> Vec<UsageRow> {
        let mut totals: HashMap<(String, String), UsageRow> = HashMap::new();
        for row in self.usage.read().iter() {
            if row.conversation_id != conversation_id {
                continue;
            }
            let entry = totals
                .entry((row.provider.clone(), row.model.clone()))
                .or_insert_with(|| UsageRow {
                    conversation_id: conversation_id.to_owned(),
                    provider: row.provider.clone(),
                    model: row.model.clone(),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    embedding_tokens: 0,
                    cached_tokens: 0,
                    total_tokens: 0,
                });
            entry.prompt_tokens += row.prompt_tokens;
            entry.completion_tokens += row.completion_tokens;
            entry.embedding_tokens += row.embedding_tokens;
            entry.cached_tokens += row.cached_tokens;
            entry.total_tokens += row.total_tokens;
        }
        let mut out: Vec<UsageRow> = totals.into_values().collect();
        out.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        out
    }

    // ── Internals ────────────────────────────────────────────────────

    fn conv_state(&self, conversation_id: &str) -> Result<Arc<Mutex<ConvState>>> {
        self.messages
            .read()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))
    }

    fn transcript_path(&self, conversation_id: &str) -> PathBuf {
        self.state_dir
            .join("transcripts")
            .join(format!("{conversation_id}.jsonl"))
    }

    fn append_line(&self, conversation_id: &str, line: &TranscriptLine) -> Result<()> {
        let json = serde_json::to_string(line)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(conversation_id))
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)
    }

    fn append_jsonl<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.state_dir.join(name))
            .map_err(Error::Io)?;
        writeln!(file, "{json}").map_err(Error::Io)
    }

    fn persist_conversations(&self) -> Result<()> {
        let snapshot = serde_json::to_string_pretty(&*self.conversations.read())?;
        std::fs::write(self.state_dir.join("conversations.json"), snapshot).map_err(Error::Io)
    }

    fn persist_turns(&self) -> Result<()> {
        let snapshot = serde_json::to_string_pretty(&*self.turns.read())?;
        std::fs::write(self.state_dir.join("turns.json"), snapshot).map_err(Error::Io)
    }
}

fn apply_patch(message: &mut MessageRecord, patch: &MessagePatch) {
    if let Some(status) = patch.status {
        message.status = status;
    }
    if let Some(interim) = patch.interim {
        message.interim = interim;
    }
    if let Some(content) = &patch.content {
        message.content = content.clone();
    }
    if let Some(attachments) = &patch.attachments {
        message.attachments = attachments.clone();
    }
    if let Some(elicitation) = &patch.elicitation {
        message.elicitation = Some(elicitation.clone());
    }
    if let Some(tool_call) = &patch.tool_call {
        message.tool_call = Some(tool_call.clone());
    }
    if let Some(model_call) = &patch.model_call {
        message.model_call = Some(model_call.clone());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
