//! Per-turn cancellation handles with conversation fan-out.
//!
//! Each running turn registers a `CancelToken`. `cancel_turn` signals one
//! turn; `cancel_conversation` signals every running turn of a
//! conversation. Handles cooperate: the runtime checks the token at every
//! suspension point and aborts the current operation promptly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CancelToken
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token checked (and awaited) by the runtime loop.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancellation is requested. Usable in `tokio::select!`
    /// against long-running calls.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Identity comparison, used for handle removal.
    pub fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CancelRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct RegistryInner {
    /// turn id → registered handles.
    turns: HashMap<Uuid, Vec<CancelToken>>,
    /// conversation id → turn ids with at least one handle.
    conversations: HashMap<String, Vec<Uuid>>,
}

/// Tracks cancel handles for running turns. One mutex guards both maps so
/// register/complete/cancel interleavings stay consistent.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<RegistryInner>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle for a turn.
    pub fn register(&self, conversation_id: &str, turn_id: Uuid, handle: CancelToken) {
        let mut inner = self.inner.lock();
        inner.turns.entry(turn_id).or_default().push(handle);
        let turns = inner
            .conversations
            .entry(conversation_id.to_owned())
            .or_default();
        if !turns.contains(&turn_id) {
            turns.push(turn_id);
        }
    }

    /// Remove a handle by identity (called when the turn completes).
    /// Completing after a cancel is a no-op.
    pub fn complete(&self, conversation_id: &str, turn_id: Uuid, handle: &CancelToken) {
        let mut inner = self.inner.lock();
        if let Some(handles) = inner.turns.get_mut(&turn_id) {
            handles.retain(|h| !h.same(handle));
            if handles.is_empty() {
                inner.turns.remove(&turn_id);
                if let Some(turns) = inner.conversations.get_mut(conversation_id) {
                    turns.retain(|t| *t != turn_id);
                    if turns.is_empty() {
                        inner.conversations.remove(conversation_id);
                    }
                }
            }
        }
    }

    /// Cancel one turn. Returns whether at least one handle was invoked.
    pub fn cancel_turn(&self, turn_id: Uuid) -> bool {
        let handles: Vec<CancelToken> = self
            .inner
            .lock()
            .turns
            .get(&turn_id)
            .map(|h| h.to_vec())
            .unwrap_or_default();
        for handle in &handles {
            handle.cancel();
        }
        !handles.is_empty()
    }

    /// Cancel every running turn of a conversation. Returns whether at
    /// least one handle was invoked.
    pub fn cancel_conversation(&self, conversation_id: &str) -> bool {
        let turn_ids: Vec<Uuid> = self
            .inner
            .lock()
            .conversations
            .get(conversation_id)
            .map(|t| t.to_vec())
            .unwrap_or_default();
        let mut any = false;
        for turn_id in turn_ids {
            any |= self.cancel_turn(turn_id);
        }
        any
    }

    /// Whether a conversation has a registered (running) turn.
    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.inner
            .lock()
            .conversations
            .get(conversation_id)
            .is_some_and(|t| !t.is_empty())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
