//! Durable conversation transcripts: conversations, turns, messages with
//! per-conversation monotonic sequences, payloads, and usage rows.

pub mod store;
pub mod types;
pub mod usage;

pub use store::{ListFilter, MessagePatch, NewConversation, NewMessage, TranscriptStore};
pub use types::*;
pub use usage::UsageAggregator;
