//! Per-turn usage aggregation.
//!
//! Providers report usage through [`UsageAggregator::on_usage`] as responses
//! arrive; at turn end the aggregator is flushed into the store as one usage
//! row per model.

use std::collections::HashMap;

use parking_lot::Mutex;

use pv_domain::error::Result;
use pv_domain::stream::Usage;
use pv_domain::trace::TraceEvent;

use crate::store::TranscriptStore;
use crate::types::UsageRow;

/// Accumulates provider-reported usage per model for one turn.
#[derive(Default)]
pub struct UsageAggregator {
    counters: Mutex<HashMap<String, Usage>>,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a provider usage report for `model` (`provider/model` form).
    pub fn on_usage(&self, model: &str, stats: &Usage) {
        self.counters
            .lock()
            .entry(model.to_owned())
            .or_default()
            .add(stats);
    }

    /// Snapshot of accumulated usage, sorted by model name.
    pub fn snapshot(&self) -> Vec<(String, Usage)> {
        let mut out: Vec<(String, Usage)> = self
            .counters
            .lock()
            .iter()
            .map(|(model, usage)| (model.clone(), usage.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Sum across all models.
    pub fn total(&self) -> Usage {
        let mut total = Usage::default();
        for usage in self.counters.lock().values() {
            total.add(usage);
        }
        total
    }

    /// Write one usage row per model into the store and clear the
    /// aggregator.
    pub fn flush(&self, store: &TranscriptStore, conversation_id: &str) -> Result<()> {
        let drained: Vec<(String, Usage)> = self.counters.lock().drain().collect();
        if drained.is_empty() {
            return Ok(());
        }

        let mut total_tokens = 0u64;
        let models = drained.len();
        for (model, usage) in drained {
            let (provider, model) = split_model(&model);
            total_tokens += usage.total_tokens as u64;
            store.add_usage(UsageRow {
                conversation_id: conversation_id.to_owned(),
                provider,
                model,
                prompt_tokens: usage.prompt_tokens as u64,
                completion_tokens: usage.completion_tokens as u64,
                embedding_tokens: usage.embedding_tokens as u64,
                cached_tokens: usage.cached_tokens as u64,
                total_tokens: usage.total_tokens as u64,
            })?;
        }

        TraceEvent::UsageFlushed {
            conversation_id: conversation_id.to_owned(),
            models,
            total_tokens,
        }
        .emit();
        Ok(())
    }
}

/// Split `provider/model` into its parts; bare names get the "default"
/// provider.
fn split_model(model: &str) -> (String, String) {
    match model.split_once('/') {
        Some((provider, rest)) => (provider.to_owned(), rest.to_owned()),
        None => ("default".to_owned(), model.to_owned()),
    }
}
