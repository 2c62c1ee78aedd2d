//! Interactive awaiters — suspend a turn on an elicitation or approval
//! until an external resolver delivers the user's decision.
//!
//! The planner registers a waiter keyed by the prompt message id and parks
//! on the returned channel. The REST callbacks (`/elicitation/{msgId}`,
//! `/approval/{msgId}`) resolve it. A timeout in the planner ensures the
//! system never blocks indefinitely.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What kind of prompt the turn is suspended on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    Elicitation,
    Approval,
}

/// The decision delivered by the external resolver.
#[derive(Debug, Clone)]
pub enum Resolution {
    Accept { payload: Option<serde_json::Value> },
    Decline { reason: Option<String> },
    Cancel,
}

struct PendingWaiter {
    conversation_id: String,
    kind: WaitKind,
    created_at: DateTime<Utc>,
    respond: oneshot::Sender<Resolution>,
}

/// Serializable snapshot of a pending waiter (introspection).
#[derive(Debug, Clone, Serialize)]
pub struct WaiterInfo {
    pub message_id: String,
    pub conversation_id: String,
    pub kind: WaitKind,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thread-safe map of suspended prompts, keyed by message id.
#[derive(Default)]
pub struct AwaiterRegistry {
    pending: RwLock<HashMap<String, PendingWaiter>>,
}

impl AwaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a prompt message. The turn parks on the
    /// returned receiver.
    pub fn register(
        &self,
        message_id: &str,
        conversation_id: &str,
        kind: WaitKind,
    ) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(
            message_id.to_owned(),
            PendingWaiter {
                conversation_id: conversation_id.to_owned(),
                kind,
                created_at: Utc::now(),
                respond: tx,
            },
        );
        rx
    }

    /// Deliver a resolution. Returns the waiter's kind if one was pending.
    pub fn resolve(&self, message_id: &str, resolution: Resolution) -> Option<WaitKind> {
        let waiter = self.pending.write().remove(message_id)?;
        let kind = waiter.kind;
        // The receiver may have timed out concurrently; that's fine.
        let _ = waiter.respond.send(resolution);
        Some(kind)
    }

    /// What kind of prompt is pending on a message id, if any.
    pub fn kind_of(&self, message_id: &str) -> Option<WaitKind> {
        self.pending.read().get(message_id).map(|w| w.kind)
    }

    /// Drop a waiter whose receiver timed out.
    pub fn remove_expired(&self, message_id: &str) {
        self.pending.write().remove(message_id);
    }

    pub fn list_pending(&self) -> Vec<WaiterInfo> {
        self.pending
            .read()
            .iter()
            .map(|(id, w)| WaiterInfo {
                message_id: id.clone(),
                conversation_id: w.conversation_id.clone(),
                kind: w.kind,
                created_at: w.created_at,
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
