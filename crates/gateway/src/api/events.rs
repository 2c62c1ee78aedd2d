//! Event delivery — long-poll JSON batches and SSE streams.
//!
//! `GET /v1/api/conversations/{id}/events?wait=&since=&history=`:
//! - with `wait=<seconds>`: long-poll; returns the batch of envelopes
//!   with seq > `since` (possibly empty) and the highest seq seen.
//! - without `wait`: a `text/event-stream`; with `history=1` the
//!   finalized transcript replays in sequence order before live events.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::api::envelope::{self, ApiResult};
use crate::runtime::events::Outbound;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Long-poll wait in seconds. Presence selects long-poll mode.
    #[serde(default)]
    pub wait: Option<u64>,
    #[serde(default)]
    pub since: Option<u64>,
    #[serde(default)]
    pub history: Option<u8>,
}

/// Cap on a single long-poll wait.
const MAX_WAIT: Duration = Duration::from_secs(60);

fn outbound_json(o: &Outbound) -> Value {
    let mut v = serde_json::to_value(&o.envelope).unwrap_or(Value::Null);
    v["event"] = Value::String(o.event.as_str().to_owned());
    v
}

pub async fn events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> ApiResult {
    state.store.get_conversation(&id)?;

    if let Some(wait) = q.wait {
        let wait = Duration::from_secs(wait).min(MAX_WAIT);
        let since = q.since.unwrap_or(0);
        let (batch, latest) = state
            .events
            .long_poll(&state.store, &id, since, wait)
            .await?;
        let events: Vec<Value> = batch.iter().map(outbound_json).collect();
        return Ok(envelope::ok(serde_json::json!({
            "events": events,
            "latest": latest,
        })));
    }

    Ok(sse_stream(state, id, q).into_response())
}

fn sse_stream(
    state: AppState,
    conversation_id: String,
    q: EventsQuery,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let stream = async_stream::stream! {
        // Subscribe before replaying so no commit is lost in between. A
        // commit landing inside that window can surface twice (once from
        // replay, once live) — exactly-once delivery is a non-goal, and
        // per-seq ordering is preserved either way.
        let mut rx = state.events.subscribe(&conversation_id);
        let since = q.since.unwrap_or(0);

        if q.history == Some(1) {
            match state.events.replay(&state.store, &conversation_id, since) {
                Ok(batch) => {
                    for outbound in batch {
                        yield Ok(to_sse_event(&outbound));
                    }
                }
                Err(e) => {
                    yield Ok(Event::default()
                        .event("error")
                        .data(serde_json::json!({ "error": e.to_string() }).to_string()));
                    return;
                }
            }
        }

        loop {
            match rx.recv().await {
                Ok(outbound) => {
                    // Events at or before the client's cursor are skipped;
                    // interim deltas (seq 0) always flow. Lifecycle
                    // transitions reuse their message's seq, so the filter
                    // only looks at the resume cursor.
                    if outbound.envelope.seq != 0 && outbound.envelope.seq <= since {
                        continue;
                    }
                    yield Ok(to_sse_event(&outbound));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(outbound: &Outbound) -> Event {
    Event::default()
        .event(outbound.event.as_str())
        .data(serde_json::to_string(&outbound.envelope).unwrap_or_default())
}
